use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use service::session::SubscriberInfo;

/// Monotonic counter readable without synchronization; eventual
/// consistency is fine for stats consumers.
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Count {
    pub fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters only the broadcast path increments.
#[derive(Default)]
pub struct Counts {
    pub rtcm_frames: Count,
    pub bytes_broadcast: Count,
}

/// Most recent fix the receiver reported over NMEA GGA. All zeros until
/// the first sentence arrives.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GpsStatus {
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Immutable point-in-time view of the whole server.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rtcm_frames: usize,
    pub bytes_broadcast: usize,
    pub uptime: Duration,
    pub gps: GpsStatus,
    pub subscribers: Vec<SubscriberInfo>,
}

impl Snapshot {
    pub fn active_clients(&self) -> usize {
        self.subscribers.len()
    }
}

/// Shared statistics handle held by every worker.
#[derive(Clone)]
pub struct Statistics {
    counts: Arc<Counts>,
    gps: Arc<RwLock<GpsStatus>>,
    started_at: Instant,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            counts: Default::default(),
            gps: Default::default(),
            started_at: Instant::now(),
        }
    }
}

impl Statistics {
    /// One broadcast frame of the given size.
    pub fn add_frame(&self, size: usize) {
        self.counts.rtcm_frames.add(1);
        self.counts.bytes_broadcast.add(size);
    }

    pub fn update_gps(&self, status: GpsStatus) {
        *self.gps.write() = status;
    }

    pub fn snapshot(&self, subscribers: Vec<SubscriberInfo>) -> Snapshot {
        Snapshot {
            rtcm_frames: self.counts.rtcm_frames.get(),
            bytes_broadcast: self.counts.bytes_broadcast.get(),
            uptime: self.started_at.elapsed(),
            gps: *self.gps.read(),
            subscribers,
        }
    }
}
