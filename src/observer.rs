use std::sync::Arc;

use service::{ServiceHandler, session::SubscriberInfo};

use crate::config::Config;

/// Bridges service events to the logger and answers credential lookups
/// from the static table in the configuration.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
}

impl Observer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ServiceHandler for Observer {
    fn get_password(&self, username: &str) -> Option<String> {
        self.config.auth.static_credentials.get(username).cloned()
    }

    fn auth_required(&self) -> bool {
        !self.config.auth.static_credentials.is_empty()
    }

    fn on_subscribed(&self, subscriber: &SubscriberInfo) {
        log::info!(
            "client subscribed: addr={:?}, mountpoint={:?}",
            subscriber.address,
            subscriber.mountpoint
        );
    }

    /// Also fires for evicted laggards; a dropped client is routine, so
    /// nothing here logs above info.
    fn on_closed(&self, subscriber: &SubscriberInfo) {
        log::info!(
            "client disconnected: addr={:?}, mountpoint={:?}, sent={} bytes",
            subscriber.address,
            subscriber.mountpoint,
            subscriber.bytes_sent
        );
    }
}
