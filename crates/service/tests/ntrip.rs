use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tokio::{io::AsyncReadExt, io::duplex, time::timeout};

use ntrip_server_service::{
    Routing, Service, ServiceHandler, ServiceOptions,
    request::{Error, Request},
    sourcetable::{Caster, Mountpoint},
};

#[derive(Default, Clone)]
struct Handler {
    credentials: HashMap<String, String>,
}

impl ServiceHandler for Handler {
    fn get_password(&self, username: &str) -> Option<String> {
        self.credentials.get(username).cloned()
    }

    fn auth_required(&self) -> bool {
        !self.credentials.is_empty()
    }
}

fn service(credentials: &[(&str, &str)]) -> Service<Handler> {
    Service::new(ServiceOptions {
        software: "ntrip-rs.test".to_string(),
        caster: Caster::default(),
        mountpoints: vec![Mountpoint {
            name: "BASE".to_string(),
            lat: 43.56,
            lon: -116.60,
            ..Default::default()
        }],
        handler: Handler {
            credentials: credentials
                .iter()
                .map(|(username, password)| (username.to_string(), password.to_string()))
                .collect(),
        },
    })
}

fn address(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[test]
fn test_request_parser() -> Result<()> {
    let request = Request::parse("GET /BASE HTTP/1.1\r\nHost: caster\r\nUser-Agent: NTRIP rover\r\n\r\n")?;
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/BASE");
    assert_eq!(request.header("host"), Some("caster"));
    assert_eq!(request.header("User-Agent"), Some("NTRIP rover"));
    assert_eq!(request.header("Authorization"), None);
    assert_eq!(request.basic_credentials(), None);

    // Bare-\n line endings are tolerated on input.
    let request = Request::parse("GET / HTTP/1.0\nHost: caster\n\n")?;
    assert_eq!(request.path, "/");

    // dTpw = base64("u:p")
    let request = Request::parse("GET /BASE HTTP/1.1\r\nAuthorization: Basic dTpw\r\n\r\n")?;
    assert_eq!(
        request.basic_credentials(),
        Some(("u".to_string(), "p".to_string()))
    );

    let request = Request::parse("GET /BASE HTTP/1.1\r\nAuthorization: Bearer dTpw\r\n\r\n")?;
    assert_eq!(request.basic_credentials(), None);

    assert_eq!(
        Request::parse("GET /BASE\r\n\r\n").unwrap_err(),
        Error::BadRequestLine
    );
    assert_eq!(
        Request::parse("GET /BASE HTTP/1.1\r\nHost: caster\r\n").unwrap_err(),
        Error::UnterminatedHeaders
    );

    Ok(())
}

#[test]
fn test_sourcetable() {
    let service = service(&[]);

    let Routing::Close(table) = service.route("GET / HTTP/1.1\r\nHost: x\r\n\r\n") else {
        panic!("sourcetable request must close the connection");
    };

    assert!(table.starts_with("SOURCETABLE 200 OK\r\n"));
    assert!(table.contains("Content-Type: text/plain\r\n"));
    assert!(table.contains("\r\nCAS;0.0.0.0;2101;LC29H RTK Base;LC29H;0;USA;0.00;0.00;http://example.com\r\n"));
    assert!(table.contains("\r\nSTR;BASE;BASE;RTCM 3.3;"));
    assert!(table.contains(";43.56;-116.60;"));
    assert!(table.ends_with("ENDSOURCETABLE\r\n"));
}

#[test]
fn test_routing() {
    let open = service(&[]);

    match open.route("GET /NOPE HTTP/1.1\r\n\r\n") {
        Routing::Close(response) => {
            assert!(response.starts_with("HTTP/1.1 404 Mountpoint not found\r\n"))
        }
        _ => panic!("unknown mountpoint must be rejected"),
    }

    match open.route("POST /BASE HTTP/1.1\r\n\r\n") {
        Routing::Close(response) => assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n")),
        _ => panic!("only GET is accepted"),
    }

    match open.route("GET /BASE\r\n\r\n") {
        Routing::Close(response) => assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n")),
        _ => panic!("a two-token request line is malformed"),
    }

    // No credential table: every mountpoint is open.
    match open.route("GET /BASE HTTP/1.1\r\n\r\n") {
        Routing::Stream {
            response,
            mountpoint,
        } => {
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("Content-Type: gnss/data\r\n"));
            assert!(response.ends_with("\r\n\r\n"));
            assert_eq!(mountpoint, "BASE");
        }
        _ => panic!("open mountpoint must admit"),
    }

    let secured = service(&[("u", "p")]);

    match secured.route("GET /BASE HTTP/1.1\r\n\r\n") {
        Routing::Close(response) => {
            assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
            assert!(response.contains("WWW-Authenticate: Basic realm=\"NTRIP\"\r\n"));
        }
        _ => panic!("missing credentials must be rejected"),
    }

    match secured.route("GET /BASE HTTP/1.1\r\nAuthorization: Basic dTpx\r\n\r\n") {
        Routing::Close(response) => assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n")),
        _ => panic!("wrong password must be rejected"),
    }

    match secured.route("GET /BASE HTTP/1.1\r\nAuthorization: Basic dTpw\r\n\r\n") {
        Routing::Stream { response, .. } => assert!(response.starts_with("HTTP/1.1 200 OK\r\n")),
        _ => panic!("correct credentials must admit"),
    }
}

#[tokio::test]
async fn test_broadcast_fanout() -> Result<()> {
    let service = service(&[]);

    let (mut first, first_writer) = duplex(65536);
    let (mut second, second_writer) = duplex(65536);
    let _first_sub = service.subscribe(address(40001), "BASE".to_string(), first_writer);
    let _second_sub = service.subscribe(address(40002), "BASE".to_string(), second_writer);
    assert_eq!(service.sessions().len(), 2);

    service.publish(Bytes::from_static(b"frame-1")).await;
    service.publish(Bytes::from_static(b"frame-2")).await;

    // Both subscribers see both frames, contiguous and in order.
    let mut received = [0u8; 14];
    first.read_exact(&mut received).await?;
    assert_eq!(&received, b"frame-1frame-2");
    second.read_exact(&mut received).await?;
    assert_eq!(&received, b"frame-1frame-2");

    // A hung-up send path is dropped by the very next broadcast and
    // never sees another frame.
    drop(second);
    service.publish(Bytes::from_static(b"frame-3")).await;
    assert_eq!(service.sessions().len(), 1);

    let mut received = [0u8; 7];
    first.read_exact(&mut received).await?;
    assert_eq!(&received, b"frame-3");

    let snapshot = service.sessions().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].address, address(40001));
    assert_eq!(snapshot[0].mountpoint, "BASE");
    assert_eq!(snapshot[0].bytes_sent, 21);

    // Removal is idempotent.
    service.unsubscribe(&address(40002));
    service.unsubscribe(&address(40001));
    assert!(service.sessions().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_slow_subscriber_eviction() -> Result<()> {
    let service = service(&[]);

    let (mut draining, draining_writer) = duplex(65536);
    let (stalled, stalled_writer) = duplex(64);
    let _draining_sub = service.subscribe(address(40011), "BASE".to_string(), draining_writer);
    let _stalled_sub = service.subscribe(address(40012), "BASE".to_string(), stalled_writer);

    // The stalled peer's 64-byte pipe cannot absorb the frame and its
    // owner never reads: the timed write gives up and that same
    // broadcast evicts the subscriber, without queueing anything.
    let frame = Bytes::from(vec![0x7E; 256]);
    service.publish(frame.clone()).await;

    assert_eq!(service.sessions().len(), 1);
    assert_eq!(service.sessions().snapshot()[0].address, address(40011));

    // The healthy subscriber got the frame and keeps receiving.
    let mut received = vec![0u8; 256];
    draining.read_exact(&mut received).await?;
    assert_eq!(&received[..], &frame[..]);

    service.publish(Bytes::from_static(b"after")).await;
    let mut received = [0u8; 5];
    draining.read_exact(&mut received).await?;
    assert_eq!(&received, b"after");

    drop(stalled);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_subscribers() -> Result<()> {
    let service = service(&[]);

    let (mut client, writer) = duplex(65536);
    let subscription = service.subscribe(address(40021), "BASE".to_string(), writer);

    service.publish(Bytes::from_static(b"frame")).await;
    service.shutdown();
    assert!(service.sessions().is_empty());

    // The close signal reaches the connection task.
    timeout(Duration::from_secs(1), subscription.closed).await??;

    // Bytes already written stay readable, then the stream ends.
    let mut received = [0u8; 5];
    client.read_exact(&mut received).await?;
    assert_eq!(&received, b"frame");
    assert_eq!(client.read(&mut [0u8; 16]).await?, 0);

    Ok(())
}
