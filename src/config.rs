use std::{collections::HashMap, fs::read_to_string, net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use service::sourcetable::{Caster, Mountpoint};

/// Serial link to the GNSS receiver, 8N1 framing.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Serial {
    ///
    /// Serial port device path
    ///
    #[serde(default = "Serial::port")]
    pub port: String,
    ///
    /// Line speed
    ///
    /// The receiver interleaves NMEA and RTCM3 on this link; 115200 is
    /// the rate the module ships with.
    ///
    #[serde(default = "Serial::baudrate")]
    pub baudrate: u32,
    ///
    /// Read timeout in milliseconds
    ///
    /// Bounds every blocking read so the reader notices shutdown and
    /// transient stalls instead of hanging on the device.
    ///
    #[serde(default = "Serial::timeout")]
    pub timeout: u64,
}

impl Serial {
    fn port() -> String {
        "/dev/ttyUSB0".to_string()
    }

    fn baudrate() -> u32 {
        115200
    }

    fn timeout() -> u64 {
        1000
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self {
            port: Self::port(),
            baudrate: Self::baudrate(),
            timeout: Self::timeout(),
        }
    }
}

/// Surveyed antenna position of the stationary base.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Station {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    ///
    /// Ellipsoidal height in meters
    ///
    #[serde(default)]
    pub altitude: f64,
    ///
    /// RTCM message types the receiver is asked to emit
    ///
    /// The default covers the reference station position and one MSM4
    /// observable message per constellation.
    ///
    #[serde(default = "Station::messages")]
    pub messages: Vec<u16>,
}

impl Station {
    fn messages() -> Vec<u16> {
        vec![1005, 1074, 1084, 1094, 1124, 1230]
    }
}

impl Default for Station {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            messages: Self::messages(),
        }
    }
}

/// Caster listener settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ntrip {
    ///
    /// ntrip caster listen address
    ///
    /// The address and port clients connect to; 2101 is the registered
    /// NTRIP port.
    ///
    #[serde(default = "Ntrip::listen")]
    pub listen: SocketAddr,
    ///
    /// Caster description advertised on the source-table CAS line.
    ///
    #[serde(default)]
    pub caster: Caster,
}

impl Ntrip {
    fn listen() -> SocketAddr {
        "0.0.0.0:2101".parse().unwrap()
    }
}

impl Default for Ntrip {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            caster: Caster::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// static user password table
    ///
    /// Clients authenticate with HTTP Basic against this table. An empty
    /// table disables authentication and leaves every mountpoint open.
    ///
    #[serde(default)]
    pub static_credentials: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub serial: Serial,
    #[serde(default)]
    pub station: Station,
    #[serde(default)]
    pub ntrip: Ntrip,
    ///
    /// mountpoints hosted by the caster
    ///
    /// Registered once at startup; the set is immutable afterwards. All
    /// subscribers receive the same stream, the name only gates
    /// admission.
    ///
    #[serde(default, rename = "mountpoint")]
    pub mountpoints: Vec<Mountpoint>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: ntrip-server --config /etc/ntrip-server/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str(
            &Cli::parse()
                .config
                .map(read_to_string)
                .transpose()?
                .unwrap_or_default(),
        )?)
    }
}
