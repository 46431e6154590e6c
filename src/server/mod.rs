use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
    time::{sleep, timeout},
};

use service::{Routing, Service, ServiceHandler, request::MAX_REQUEST_SIZE};

/// Deadline for a client to deliver its complete request, and to drain
/// the response head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Running caster listener.
///
/// Stopping is two-phase, so the caller can order it around closing the
/// subscriber registry: [`Server::close`] stops accepting and closes the
/// listening socket, [`Server::wait`] then joins in-flight connection
/// tasks up to a bounded grace period.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
    accepter: JoinHandle<()>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes the listening socket. Connections
    /// already admitted keep streaming until the registry drops them.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Waits for in-flight connection tasks to finish, up to the grace
    /// period. Closes the listener first if [`Server::close`] was not
    /// called already.
    pub async fn wait(self, grace: Duration) {
        self.shutdown.notify_one();
        let _ = self.accepter.await;

        let deadline = Instant::now() + grace;
        while self.active.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Decrements the in-flight connection count when a handler task ends,
/// however it ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Binds the caster listener and spawns the accept loop. Failing to
/// bind is fatal; from then on every connection lives in its own task
/// and the returned handle is only needed again for shutdown.
pub async fn start<T>(listen: SocketAddr, service: &Arc<Service<T>>) -> Result<Server>
where
    T: ServiceHandler + 'static,
{
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = Arc::new(Notify::new());
    let active = Arc::new(AtomicUsize::new(0));
    let service = service.clone();

    let accepter = tokio::spawn({
        let shutdown = shutdown.clone();
        let active = active.clone();

        async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((socket, address)) => {
                            log::debug!("ntrip connection accepted: addr={address:?}, interface={local_addr:?}");

                            active.fetch_add(1, Ordering::Relaxed);
                            let guard = ConnectionGuard(active.clone());
                            let service = service.clone();

                            tokio::spawn(async move {
                                let _guard = guard;
                                handle(socket, address, service).await;
                            });
                        }
                        Err(e) => {
                            log::error!("ntrip accept failed: interface={local_addr:?}, err={e}");
                            break;
                        }
                    },
                    _ = shutdown.notified() => break,
                }
            }

            // Dropping the listener here is what actually closes it.
            log::info!("ntrip listener closed: interface={local_addr:?}");
        }
    });

    log::info!("ntrip caster listening: listen={local_addr}");

    Ok(Server {
        local_addr,
        shutdown,
        active,
        accepter,
    })
}

async fn handle<T: ServiceHandler>(mut socket: TcpStream, address: SocketAddr, service: Arc<Service<T>>) {
    // Corrections are time-valuable, never batch them.
    if let Err(e) = socket.set_nodelay(true) {
        log::warn!("tcp socket set nodelay failed: addr={address:?}, err={e}");
    }

    let request = match read_request(&mut socket).await {
        Ok(request) => request,
        Err(e) => {
            log::debug!("request read failed: addr={address:?}, err={e}");
            return;
        }
    };

    // Response writes are bounded too; a peer that refuses to drain its
    // own rejection does not get to park the task.
    match service.route(&request) {
        Routing::Close(response) => {
            let _ = timeout(REQUEST_TIMEOUT, socket.write_all(response.as_bytes())).await;
        }
        Routing::Stream {
            response,
            mountpoint,
        } => {
            match timeout(REQUEST_TIMEOUT, socket.write_all(response.as_bytes())).await {
                Ok(Ok(())) => stream(socket, address, mountpoint, &service).await,
                _ => return,
            }
        }
    }

    log::debug!("ntrip connection closed: addr={address:?}");
}

/// Reads up to the header terminator, tolerating bare-`\n` endings. The
/// parser rejects whatever arrives truncated or oversized.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = vec![0u8; MAX_REQUEST_SIZE];
    let mut size = 0;

    timeout(REQUEST_TIMEOUT, async {
        loop {
            let read = socket.read(&mut buffer[size..]).await?;
            if read == 0 {
                break;
            }

            size += read;
            let received = &buffer[..size];
            if received.windows(4).any(|window| window == b"\r\n\r\n")
                || received.windows(2).any(|window| window == b"\n\n")
                || size == buffer.len()
            {
                break;
            }
        }

        std::io::Result::Ok(())
    })
    .await
    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    Ok(String::from_utf8_lossy(&buffer[..size]).into_owned())
}

/// After admission the registry owns the write half: every frame it
/// sends is a timed write, so a peer that stops reading stalls nothing
/// beyond its own eviction. This task keeps the read half to notice the
/// peer hanging up; whatever the client sends while streaming (rovers
/// often report their position in NMEA) is discarded. Failures after
/// admission are silent, the peer sees whatever the OS produces.
async fn stream<T: ServiceHandler>(
    socket: TcpStream,
    address: SocketAddr,
    mountpoint: String,
    service: &Arc<Service<T>>,
) {
    let (mut reader, writer) = socket.into_split();
    let mut subscription = service.subscribe(address, mountpoint, writer);
    let mut discard = [0u8; 512];

    loop {
        tokio::select! {
            // The registry dropped us: evicted, or server shutdown.
            _ = &mut subscription.closed => break,
            result = reader.read(&mut discard) => match result {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    service.unsubscribe(&address);
}
