//! The little NMEA 0183 surface the serial link needs: checksummed
//! sentence building for the receiver command channel, and GGA fix
//! parsing for diagnostics. Everything else on the wire is ignored.

use super::Error;

/// XOR checksum over a sentence body (the characters between `$` and `*`).
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |sum, byte| sum ^ byte)
}

/// Wraps a body into a complete `$<body>*<checksum>` sentence.
///
/// # Test
///
/// ```
/// use ntrip_server_codec::nmea::sentence;
///
/// assert_eq!(sentence("PAIR065,0,1"), "$PAIR065,0,1*38\r\n");
/// ```
pub fn sentence(body: &str) -> String {
    format!("${}*{:02X}\r\n", body, checksum(body))
}

/// A GGA fix: the essential position/quality sentence every GNSS receiver
/// emits, here only used to report receiver health.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Gga {
    /// Decimal degrees, negative south.
    pub latitude: f64,
    /// Decimal degrees, negative west.
    pub longitude: f64,
    /// 0 = no fix, 1 = GPS, 2 = DGPS, 4 = RTK fixed, 5 = RTK float.
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: f64,
    /// Meters above mean sea level.
    pub altitude: f64,
}

impl Gga {
    /// Parses a `$..GGA` sentence, validating its checksum. Fields a
    /// receiver leaves empty before it has a fix parse as zero.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        let body = line.strip_prefix('$').ok_or(Error::BadSentence)?;
        let (body, sum) = body.split_once('*').ok_or(Error::BadSentence)?;

        let sum = u8::from_str_radix(sum.trim(), 16).map_err(|_| Error::BadChecksum)?;
        if checksum(body) != sum {
            return Err(Error::BadChecksum);
        }

        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 10 || !fields[0].ends_with("GGA") {
            return Err(Error::BadSentence);
        }

        Ok(Self {
            latitude: degrees(fields[2])? * hemisphere(fields[3], 'S'),
            longitude: degrees(fields[4])? * hemisphere(fields[5], 'W'),
            fix_quality: number(fields[6])? as u8,
            satellites: number(fields[7])? as u8,
            hdop: number(fields[8])?,
            altitude: number(fields[9])?,
        })
    }
}

/// `ddmm.mmmm` to decimal degrees; empty means no fix yet.
fn degrees(field: &str) -> Result<f64, Error> {
    let value = number(field)?;
    let whole = (value / 100.0).trunc();
    Ok(whole + (value - whole * 100.0) / 60.0)
}

fn hemisphere(field: &str, negative: char) -> f64 {
    if field.starts_with(negative) { -1.0 } else { 1.0 }
}

fn number(field: &str) -> Result<f64, Error> {
    if field.is_empty() {
        return Ok(0.0);
    }

    field.parse().map_err(|_| Error::BadSentence)
}
