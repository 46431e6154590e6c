pub mod config;
pub mod geo;
pub mod observer;
pub mod serial;
pub mod server;
pub mod statistics;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::runtime::Handle;

use codec::{frame, frame::Frame, station::ReferenceStation};
use service::{Service, ServiceOptions};

use self::{
    config::Config,
    observer::Observer,
    serial::FrameSink,
    statistics::{GpsStatus, Statistics},
};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "ntrip-rs.",
    env!("CARGO_PKG_VERSION")
);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight connection tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Disagreement between the configured position and the one the receiver
/// broadcasts that is worth warning about.
const STATION_OFFSET_WARNING: f64 = 5.0;

/// The broadcast fan-in handed to the serial reader: counts every frame,
/// decodes the reference position once for diagnostics, and hands the
/// bytes to the registry.
pub struct Publisher {
    service: Arc<Service<Observer>>,
    statistics: Statistics,
    station: (f64, f64),
    station_logged: AtomicBool,
    runtime: Handle,
}

impl Publisher {
    /// Captures the runtime handle, so construction must happen inside
    /// the runtime even though publishing happens on the reader thread.
    pub fn new(service: Arc<Service<Observer>>, statistics: Statistics, config: &Config) -> Self {
        Self {
            service,
            statistics,
            station: (config.station.latitude, config.station.longitude),
            station_logged: AtomicBool::new(false),
            runtime: Handle::current(),
        }
    }

    fn check_reference_position(&self, frame: &Frame) {
        let Ok(station) = ReferenceStation::decode(frame.payload()) else {
            return;
        };

        let [x, y, z] = station.ecef;
        let (latitude, longitude, altitude) = geo::ecef_to_lla(x, y, z);

        log::info!(
            "reference station: id={}, lat={:.8}, lon={:.8}, alt={:.2}",
            station.station_id,
            latitude,
            longitude,
            altitude
        );

        let offset = geo::haversine_distance(latitude, longitude, self.station.0, self.station.1);
        if offset > STATION_OFFSET_WARNING {
            log::warn!("broadcast position is {offset:.1} m away from the configured station");
        }
    }
}

impl FrameSink for Publisher {
    fn publish(&self, frame: Frame) {
        let message_type = frame.message_type();

        log::trace!(
            "rtcm frame: type={}, name={:?}, size={}",
            message_type,
            frame::message_type_name(message_type).unwrap_or("unknown"),
            frame.len()
        );

        if (message_type == 1005 || message_type == 1006)
            && !self.station_logged.swap(true, Ordering::Relaxed)
        {
            self.check_reference_position(&frame);
        }

        self.statistics.add_frame(frame.len());

        // The reader thread blocks here until the frame has been
        // written to (or evicted) every subscriber, which keeps
        // broadcasts sequential in framer-emission order.
        self.runtime.block_on(self.service.publish(frame.into_bytes()));
    }

    fn status(&self, status: GpsStatus) {
        self.statistics.update_gps(status);
    }
}

/// Builds the caster service from configuration. Mountpoints inherit the
/// surveyed position, and advertise authentication whenever a credential
/// table is present.
pub fn make_service(config: &Arc<Config>) -> Arc<Service<Observer>> {
    let auth_required = !config.auth.static_credentials.is_empty();

    let mountpoints = config
        .mountpoints
        .iter()
        .cloned()
        .map(|mut mountpoint| {
            mountpoint.lat = config.station.latitude;
            mountpoint.lon = config.station.longitude;
            mountpoint.authentication = if auth_required { "B" } else { "N" }.to_string();
            mountpoint
        })
        .collect();

    Arc::new(Service::new(ServiceOptions {
        software: SOFTWARE.to_string(),
        caster: config.ntrip.caster.clone(),
        mountpoints,
        handler: Observer::new(config.clone()),
    }))
}

/// In order to let the integration tests start the whole data plane the
/// same way the binary does, a function replaces the main function.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let statistics = Statistics::default();
    let service = make_service(&config);

    let reader = serial::Reader::start(
        &config,
        Publisher::new(service.clone(), statistics.clone(), &config),
    )?;

    let server = server::start(config.ntrip.listen, &service).await?;

    tokio::spawn({
        let service = service.clone();
        let statistics = statistics.clone();

        async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

            loop {
                interval.tick().await;

                let snapshot = statistics.snapshot(service.sessions().snapshot());
                if snapshot.active_clients() > 0 {
                    log::info!(
                        "active clients: {}, rtcm frames: {}, bytes broadcast: {}, fix={}, sats={}",
                        snapshot.active_clients(),
                        snapshot.rtcm_frames,
                        snapshot.bytes_broadcast,
                        snapshot.gps.fix_quality,
                        snapshot.gps.satellites
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");

    // Stop producing, close the listener, close every subscriber, then
    // give in-flight connection tasks a bounded grace period.
    reader.stop();
    server.close();
    service.shutdown();
    server.wait(SHUTDOWN_GRACE).await;

    let snapshot = statistics.snapshot(Vec::new());
    let uptime = snapshot.uptime.as_secs_f64();
    log::info!(
        "session summary: uptime={:.1}s, rtcm frames={}, bytes broadcast={}, rate={:.2} frames/s",
        uptime,
        snapshot.rtcm_frames,
        snapshot.bytes_broadcast,
        snapshot.rtcm_frames as f64 / uptime.max(1.0)
    );

    Ok(())
}
