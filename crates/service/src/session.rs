//! The subscriber registry.
//!
//! One producer (the serial reader) fans frames out to every admitted
//! connection. Corrections are time-valuable: each broadcast makes one
//! best-effort timed write per subscriber, and whoever cannot take the
//! frame in time is dropped on the spot. Nothing is queued per client,
//! so a stalled peer costs one write timeout and no freshness for
//! anyone else.
//!
//! The registry owns the write half of every admitted connection; the
//! connection task keeps the read half to notice the peer hanging up
//! and is woken through a close signal when the registry drops its
//! entry.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, oneshot},
    time::timeout,
};

/// How long a broadcast waits on one subscriber's write before giving
/// up and evicting it.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Point-in-time view of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub address: SocketAddr,
    pub mountpoint: String,
    pub connected_at: SystemTime,
    pub bytes_sent: u64,
}

/// Handed to the connection task at admission: resolves once the
/// registry has dropped the subscriber (eviction or shutdown), so the
/// task can hang up instead of watching a dead connection.
pub struct Subscription {
    pub closed: oneshot::Receiver<()>,
}

struct Subscriber {
    mountpoint: String,
    connected_at: SystemTime,
    bytes_sent: Arc<AtomicU64>,
    writer: Writer,
    closed: oneshot::Sender<()>,
}

impl Subscriber {
    fn info(&self, address: SocketAddr) -> SubscriberInfo {
        SubscriberInfo {
            address,
            mountpoint: self.mountpoint.clone(),
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Consumes the entry on removal, firing the close signal.
    fn into_info(self, address: SocketAddr) -> SubscriberInfo {
        let info = self.info(address);
        let _ = self.closed.send(());
        info
    }
}

/// Synchronized collection of subscribers.
///
/// The table lock is held only to register, remove and snapshot;
/// broadcast clones the send paths out first so a stalled socket never
/// blocks admission. A per-subscriber writer lock keeps every frame
/// contiguous on the wire, and the removals a broadcast decides on are
/// applied before it returns.
#[derive(Default)]
pub struct SessionManager {
    table: RwLock<AHashMap<SocketAddr, Subscriber>>,
}

impl SessionManager {
    /// Registers a subscriber, visible to the next broadcast. The
    /// registry takes ownership of the connection's write half.
    pub fn add(
        &self,
        address: SocketAddr,
        mountpoint: String,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> (Subscription, SubscriberInfo) {
        let (closed, subscription) = oneshot::channel();
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        let subscriber = Subscriber {
            mountpoint,
            connected_at: SystemTime::now(),
            bytes_sent: Arc::new(AtomicU64::default()),
            writer: Arc::new(Mutex::new(writer)),
            closed,
        };

        let info = subscriber.info(address);
        self.table.write().insert(address, subscriber);

        (Subscription { closed: subscription }, info)
    }

    /// Idempotent removal; returns the entry if it was still present.
    pub fn remove(&self, address: &SocketAddr) -> Option<SubscriberInfo> {
        self.table
            .write()
            .remove(address)
            .map(|subscriber| subscriber.into_info(*address))
    }

    /// Writes one frame to every current subscriber, a single
    /// best-effort write per subscriber bounded by [`SEND_TIMEOUT`], and
    /// returns whoever was evicted for it: a timed-out or failed write
    /// drops the subscriber immediately, it is never retried or queued.
    ///
    /// Subscribers are written sequentially, so every broadcast
    /// completes for all of them before the caller can start the next
    /// one and everyone sees frames in publish order.
    pub async fn broadcast(&self, frame: Bytes) -> Vec<SubscriberInfo> {
        let writers: Vec<(SocketAddr, Writer, Arc<AtomicU64>)> = self
            .table
            .read()
            .iter()
            .map(|(address, subscriber)| {
                (*address, subscriber.writer.clone(), subscriber.bytes_sent.clone())
            })
            .collect();

        let mut evicted = Vec::new();
        for (address, writer, bytes_sent) in writers {
            let send = timeout(SEND_TIMEOUT, async {
                writer.lock().await.write_all(&frame).await
            });

            match send.await {
                Ok(Ok(())) => {
                    bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                // Took too long, or the peer hung up.
                _ => evicted.push(address),
            }
        }

        if evicted.is_empty() {
            return Vec::new();
        }

        let mut table = self.table.write();
        evicted
            .iter()
            .filter_map(|address| table.remove(address).map(|subscriber| subscriber.into_info(*address)))
            .collect()
    }

    /// Point-in-time view for stats consumers.
    pub fn snapshot(&self) -> Vec<SubscriberInfo> {
        self.table
            .read()
            .iter()
            .map(|(address, subscriber)| subscriber.info(*address))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Drops every subscriber: write halves close and every connection
    /// task gets its close signal.
    pub fn clear(&self) -> Vec<SubscriberInfo> {
        self.table
            .write()
            .drain()
            .map(|(address, subscriber)| subscriber.into_info(address))
            .collect()
    }
}
