//! Source-table records and emission.
//!
//! The source table is the text a caster returns for `GET /`: one `CAS`
//! line describing the caster itself, one `STR` line per mountpoint, and
//! an `ENDSOURCETABLE` terminator. Field order and separators are fixed
//! by the NTRIP sourcetable format; the values are configuration.

#[cfg(feature = "serde")]
use serde::Deserialize;

/// Caster description for the CAS line. The operator URL and country are
/// advertisement only, nothing routes through them.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(rename_all = "kebab-case", default))]
pub struct Caster {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub identifier: String,
    pub country: String,
    pub url: String,
}

impl Default for Caster {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2101,
            name: "LC29H RTK Base".to_string(),
            identifier: "LC29H".to_string(),
            country: "USA".to_string(),
            url: "http://example.com".to_string(),
        }
    }
}

/// One mountpoint STR record, used both for admission (the name) and for
/// source-table emission (everything else).
///
/// Defaults describe a single-base multi-constellation RTCM 3.3 stream;
/// `format_details` lists the message types and their nominal rates.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(rename_all = "kebab-case", default))]
pub struct Mountpoint {
    pub name: String,
    /// Station identifier; empty falls back to the mountpoint name.
    pub identifier: String,
    pub format: String,
    pub format_details: String,
    /// Carrier phase: 0 = none, 1 = L1, 2 = L1+L2.
    pub carrier: String,
    pub nav_system: String,
    pub network: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    /// Whether clients are expected to send NMEA position updates.
    pub nmea: String,
    /// 0 = single base, 1 = network.
    pub solution: String,
    pub generator: String,
    pub compression: String,
    /// "B" when basic authentication is required, "N" when open.
    pub authentication: String,
    pub fee: String,
    pub bitrate: String,
}

impl Default for Mountpoint {
    fn default() -> Self {
        Self {
            name: "BASE".to_string(),
            identifier: String::new(),
            format: "RTCM 3.3".to_string(),
            format_details: "1005(10),1074(1),1084(1),1094(1),1124(1),1230(10)".to_string(),
            carrier: "2".to_string(),
            nav_system: "GPS+GLO+GAL+BDS".to_string(),
            network: "FKA".to_string(),
            country: "USA".to_string(),
            lat: 0.0,
            lon: 0.0,
            nmea: "1".to_string(),
            solution: "0".to_string(),
            generator: "LC29H".to_string(),
            compression: "none".to_string(),
            authentication: "N".to_string(),
            fee: "N".to_string(),
            bitrate: "9600".to_string(),
        }
    }
}

impl Mountpoint {
    pub fn identifier(&self) -> &str {
        if self.identifier.is_empty() {
            &self.name
        } else {
            &self.identifier
        }
    }

    fn str_line(&self) -> String {
        format!(
            "STR;{};{};{};{};{};{};{};{};{:.2};{:.2};{};{};{};{};{};{};{}\r\n",
            self.name,
            self.identifier(),
            self.format,
            self.format_details,
            self.carrier,
            self.nav_system,
            self.network,
            self.country,
            self.lat,
            self.lon,
            self.nmea,
            self.solution,
            self.generator,
            self.compression,
            self.authentication,
            self.fee,
            self.bitrate,
        )
    }
}

/// The complete `GET /` response, headers included. The connection is
/// closed once it is written.
pub fn format(software: &str, caster: &Caster, mountpoints: &[Mountpoint]) -> String {
    let mut table = String::new();
    table.push_str("SOURCETABLE 200 OK\r\n");
    table.push_str(&format!("Server: {software}\r\n"));
    table.push_str("Content-Type: text/plain\r\n");
    table.push_str("Connection: close\r\n");
    table.push_str("\r\n");

    table.push_str(&format!(
        "CAS;{};{};{};{};0;{};0.00;0.00;{}\r\n",
        caster.host,
        caster.port,
        caster.name,
        caster.identifier,
        caster.country,
        caster.url,
    ));

    for mountpoint in mountpoints {
        table.push_str(&mountpoint.str_line());
    }

    table.push_str("ENDSOURCETABLE\r\n");
    table
}
