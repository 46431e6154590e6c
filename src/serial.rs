use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};

use codec::{frame::Frame, framer::Framer, nmea};

use crate::{
    config::{Config, Station},
    statistics::GpsStatus,
};

/// Owned sink the reader is constructed with; every validated frame and
/// every fresh fix goes through it.
pub trait FrameSink: Send + 'static {
    /// A validated RTCM3 frame leaving the framer.
    fn publish(&self, frame: Frame);

    /// A checksummed GGA fix seen on the same stream.
    #[allow(unused_variables)]
    fn status(&self, status: GpsStatus) {}
}

const READ_BUFFER_SIZE: usize = 2048;

/// Pause after an empty or transiently failed read.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Settle time between receiver commands.
const COMMAND_SETTLE: Duration = Duration::from_millis(100);

/// NMEA sentences are at most 82 characters; anything longer is binary
/// noise that happened to contain a `$`.
const MAX_SENTENCE_SIZE: usize = 128;

/// The serial worker. Owns the device exclusively: after the one-shot
/// configuration nothing else writes to it, and only the worker reads.
pub struct Reader {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Reader {
    /// Opens the device, places the receiver in base mode and spawns the
    /// read worker. Failing to open or configure the port is fatal;
    /// everything after that is handled inside the worker.
    pub fn start<S: FrameSink>(config: &Config, sink: S) -> Result<Self> {
        let mut port = serialport::new(config.serial.port.as_str(), config.serial.baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.serial.read_timeout())
            .open()
            .with_context(|| format!("open serial port {}", config.serial.port))?;

        configure(port.as_mut(), &config.station)
            .with_context(|| format!("configure receiver on {}", config.serial.port))?;

        let running = Arc::new(AtomicBool::new(true));
        let worker = thread::Builder::new().name("serial-reader".to_string()).spawn({
            let running = running.clone();
            move || read_loop(port, sink, running)
        })?;

        log::info!(
            "serial reader started: port={}, baudrate={}",
            config.serial.port,
            config.serial.baudrate
        );

        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    /// Stops the worker at its next timeout boundary. Any frame still in
    /// progress in the framer is discarded with it.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// One-shot receiver setup: base mode, the surveyed position, and one
/// output-enable per requested RTCM message type.
fn configure(port: &mut dyn serialport::SerialPort, station: &Station) -> Result<()> {
    let mut command = |body: String| -> Result<()> {
        port.write_all(nmea::sentence(&body).as_bytes())?;
        log::debug!("receiver command sent: {body}");
        thread::sleep(COMMAND_SETTLE);
        Ok(())
    };

    command("PAIR065,0,1".to_string())?;
    command(format!(
        "PAIR062,{:.9},{:.9},{:.4}",
        station.latitude, station.longitude, station.altitude
    ))?;

    for message in &station.messages {
        command(format!("PAIR050,{message},1"))?;
    }

    log::info!(
        "receiver configured: lat={:.8}, lon={:.8}, alt={:.2}, messages={:?}",
        station.latitude,
        station.longitude,
        station.altitude,
        station.messages
    );

    Ok(())
}

fn read_loop<S: FrameSink>(mut port: Box<dyn serialport::SerialPort>, sink: S, running: Arc<AtomicBool>) {
    let mut framer = Framer::default();
    let mut lines = LineScanner::default();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        let size = match port.read(&mut buffer) {
            Ok(0) => {
                thread::sleep(RETRY_BACKOFF);
                continue;
            }
            Ok(size) => size,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                thread::sleep(RETRY_BACKOFF);
                continue;
            }
            Err(e) => {
                // Device gone. The caster keeps serving whatever clients
                // it has; it just stops producing frames.
                log::error!("serial read failed, stopping reader: {e}");
                break;
            }
        };

        for frame in framer.feed(&buffer[..size]) {
            sink.publish(frame);
        }

        for line in lines.feed(&buffer[..size]) {
            if let Ok(gga) = nmea::Gga::parse(&line) {
                sink.status(GpsStatus {
                    fix_quality: gga.fix_quality,
                    satellites: gga.satellites,
                    hdop: gga.hdop,
                    latitude: gga.latitude,
                    longitude: gga.longitude,
                    altitude: gga.altitude,
                });
            }
        }
    }

    log::info!("serial reader stopped");
}

/// Recovers `$`-prefixed ASCII lines from the mixed stream, independent
/// of the framer. Binary bytes abort the line in progress; the NMEA
/// checksum sorts out anything that still gets through.
#[derive(Default)]
struct LineScanner {
    buffer: Vec<u8>,
}

impl LineScanner {
    fn feed(&mut self, input: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for byte in input {
            match *byte {
                b'$' => {
                    self.buffer.clear();
                    self.buffer.push(b'$');
                }
                b'\n' if !self.buffer.is_empty() => {
                    if let Ok(line) = std::str::from_utf8(&self.buffer) {
                        lines.push(line.trim_end_matches('\r').to_string());
                    }

                    self.buffer.clear();
                }
                byte if !self.buffer.is_empty() => {
                    if byte.is_ascii() && self.buffer.len() < MAX_SENTENCE_SIZE {
                        self.buffer.push(byte);
                    } else {
                        self.buffer.clear();
                    }
                }
                _ => {}
            }
        }

        lines
    }
}
