//! ## Networked Transport of RTCM via Internet Protocol (NTRIP)
//!
//! [NTRIP]: https://igs.bkg.bund.de/ntrip/about
//!
//! NTRIP is an HTTP/1.1-shaped protocol for moving GNSS correction
//! streams: a client `GET`s a named mountpoint on a caster and, once
//! admitted, the response body is an indefinite sequence of RTCM frames.
//! `GET /` instead returns the source table, a text listing of the
//! caster and the mountpoints it hosts. Authentication, when enabled, is
//! HTTP Basic with realm `"NTRIP"`.
//!
//! This crate is the caster's protocol surface, kept free of sockets so
//! the whole admission state machine is testable with strings: request
//! parsing ([`request`]), source-table records and emission
//! ([`sourcetable`]), the subscriber registry ([`session`]) and the
//! routing that ties them together ([`Service`]). The transport loop
//! that owns the TCP connections lives in the server binary.

pub mod request;
pub mod session;
pub mod sourcetable;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncWrite;

use self::{
    request::Request,
    session::{SessionManager, SubscriberInfo, Subscription},
    sourcetable::{Caster, Mountpoint},
};

/// Credential lookup and lifecycle events, implemented by the embedding
/// server. Event hooks default to no-ops.
pub trait ServiceHandler: Send + Sync {
    /// Basic-auth password lookup. `None` means the username is unknown.
    fn get_password(&self, username: &str) -> Option<String>;

    /// Whether mountpoint requests must carry credentials. When this is
    /// false every mountpoint is open.
    fn auth_required(&self) -> bool;

    /// A client was admitted to a mountpoint.
    #[allow(unused_variables)]
    fn on_subscribed(&self, subscriber: &SubscriberInfo) {}

    /// A subscriber hung up or was evicted.
    #[allow(unused_variables)]
    fn on_closed(&self, subscriber: &SubscriberInfo) {}
}

pub struct ServiceOptions<T> {
    /// Product token reported in the `Server:` response header.
    pub software: String,
    /// Caster description for the source-table CAS line.
    pub caster: Caster,
    /// Registered once at startup, immutable afterwards. The mountpoint
    /// name gates admission; every subscriber receives the same stream.
    pub mountpoints: Vec<Mountpoint>,
    pub handler: T,
}

/// What the connection should do with a routed request.
pub enum Routing {
    /// Write the response, then close the connection.
    Close(String),
    /// Write the admission response; the connection then becomes the
    /// correction stream for the named mountpoint.
    Stream { response: String, mountpoint: String },
}

/// The caster core: routes requests against the mountpoint table and the
/// credential policy, and fans published frames out to every subscriber.
pub struct Service<T> {
    options: ServiceOptions<T>,
    sessions: SessionManager,
}

impl<T: ServiceHandler> Service<T> {
    pub fn new(options: ServiceOptions<T>) -> Self {
        Self {
            options,
            sessions: SessionManager::default(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Runs the admission state machine over a received request.
    ///
    /// `GET /` yields the source table, a known mountpoint yields the
    /// streaming admission (after the credential check when one is
    /// required), everything else yields an error response. Rejections
    /// are always reported to the client before the connection closes.
    pub fn route(&self, text: &str) -> Routing {
        let software = &self.options.software;

        let request = match Request::parse(text) {
            Ok(request) => request,
            Err(_) => return Routing::Close(request::response(software, 400, "Bad Request", "")),
        };

        if request.method != "GET" {
            return Routing::Close(request::response(software, 400, "Bad Request", ""));
        }

        if request.path == "/" {
            return Routing::Close(self.sourcetable());
        }

        let name = request.path.strip_prefix('/').unwrap_or(request.path);
        let Some(mountpoint) = self.options.mountpoints.iter().find(|mountpoint| mountpoint.name == name) else {
            return Routing::Close(request::response(software, 404, "Mountpoint not found", ""));
        };

        if self.options.handler.auth_required() && !self.authorized(&request) {
            return Routing::Close(request::response(
                software,
                401,
                "Unauthorized",
                "WWW-Authenticate: Basic realm=\"NTRIP\"\r\n",
            ));
        }

        Routing::Stream {
            response: request::response(software, 200, "OK", "Content-Type: gnss/data\r\n"),
            mountpoint: mountpoint.name.clone(),
        }
    }

    fn authorized(&self, request: &Request<'_>) -> bool {
        match request.basic_credentials() {
            Some((username, password)) => {
                self.options.handler.get_password(&username).as_deref() == Some(password.as_str())
            }
            None => false,
        }
    }

    /// The complete `GET /` response.
    pub fn sourcetable(&self) -> String {
        sourcetable::format(
            &self.options.software,
            &self.options.caster,
            &self.options.mountpoints,
        )
    }

    /// Registers an admitted connection and notifies the handler. The
    /// registry takes the write half; the connection task keeps reading
    /// until its [`Subscription`] reports closure or the peer hangs up.
    pub fn subscribe(
        &self,
        address: SocketAddr,
        mountpoint: String,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Subscription {
        let (subscription, info) = self.sessions.add(address, mountpoint, writer);
        self.options.handler.on_subscribed(&info);
        subscription
    }

    /// Drops a subscriber. Idempotent: eviction by a broadcast and the
    /// connection task noticing the hangup may race, only the first one
    /// notifies the handler.
    pub fn unsubscribe(&self, address: &SocketAddr) {
        if let Some(info) = self.sessions.remove(address) {
            self.options.handler.on_closed(&info);
        }
    }

    /// Fans one validated frame out to every current subscriber: one
    /// timed best-effort write each, eviction on timeout or error. The
    /// call returns only once every subscriber has been written to or
    /// dropped, so successive publishes stay ordered.
    pub async fn publish(&self, frame: Bytes) {
        for info in self.sessions.broadcast(frame).await {
            log::debug!(
                "subscriber evicted: addr={:?}, mountpoint={:?}",
                info.address,
                info.mountpoint
            );

            self.options.handler.on_closed(&info);
        }
    }

    /// Disconnects every subscriber. Their connection tasks observe the
    /// closed send path and hang up.
    pub fn shutdown(&self) {
        for info in self.sessions.clear() {
            self.options.handler.on_closed(&info);
        }
    }
}
