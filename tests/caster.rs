use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

use codec::{crc24q, framer::Framer};
use ntrip_server::{
    config::Config,
    make_service,
    observer::Observer,
    server::{self, Server},
};
use service::{Service, sourcetable::Mountpoint};

/// Builds a complete RTCM3 frame around a payload.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0xD3, (payload.len() >> 8) as u8, payload.len() as u8];
    bytes.extend_from_slice(payload);

    let crc = crc24q(&bytes);
    bytes.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
    bytes
}

/// A payload whose leading 12 bits carry the given message type.
fn payload(message_type: u16, size: usize) -> Vec<u8> {
    let mut payload = vec![(message_type >> 4) as u8, (message_type << 4) as u8];
    payload.resize(size, 0x5A);
    payload
}

/// Starts a caster on an ephemeral port with a single `BASE` mountpoint.
async fn start_caster(credentials: &[(&str, &str)]) -> Result<(Arc<Service<Observer>>, Server)> {
    let mut config = Config::default();
    config.ntrip.listen = "127.0.0.1:0".parse()?;
    config.station.latitude = 43.56;
    config.station.longitude = -116.60;
    config.mountpoints = vec![Mountpoint::default()];
    config.auth.static_credentials = credentials
        .iter()
        .map(|(username, password)| (username.to_string(), password.to_string()))
        .collect();

    let config = Arc::new(config);
    let service = make_service(&config);
    let server = server::start(config.ntrip.listen, &service).await?;

    Ok((service, server))
}

/// Sends a request and collects the whole response until the server
/// closes the connection.
async fn request(address: SocketAddr, request: &str) -> Result<String> {
    let mut socket = TcpStream::connect(address).await?;
    socket.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), socket.read_to_end(&mut response)).await??;

    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Sends a request and reads until the response head is complete,
/// returning the connected socket for streaming.
async fn request_stream(address: SocketAddr, request: &str) -> Result<(TcpStream, String)> {
    let mut socket = TcpStream::connect(address).await?;
    socket.write_all(request.as_bytes()).await?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(Duration::from_secs(5), socket.read_exact(&mut byte)).await??;
        head.push(byte[0]);
    }

    Ok((socket, String::from_utf8_lossy(&head).into_owned()))
}

async fn read_exactly(socket: &mut TcpStream, size: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; size];
    timeout(Duration::from_secs(5), socket.read_exact(&mut bytes)).await??;
    Ok(bytes)
}

/// Polls until the registry settles at the expected subscriber count;
/// admission runs in the connection tasks.
async fn wait_for_clients(service: &Arc<Service<Observer>>, count: usize) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while service.sessions().len() != count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn test_sourcetable() -> Result<()> {
    let (_service, server) = start_caster(&[]).await?;

    let response = request(server.local_addr(), "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await?;

    assert!(response.starts_with("SOURCETABLE 200 OK\r\n"));
    assert!(response.contains("\r\nCAS;"));
    assert!(response.contains("\r\nSTR;BASE;"));
    assert!(response.contains(";43.56;-116.60;"));
    assert!(response.ends_with("ENDSOURCETABLE\r\n"));

    Ok(())
}

#[tokio::test]
async fn test_unknown_mountpoint() -> Result<()> {
    let (_service, server) = start_caster(&[]).await?;

    let response = request(server.local_addr(), "GET /NOPE HTTP/1.1\r\n\r\n").await?;
    assert!(response.starts_with("HTTP/1.1 404"));

    Ok(())
}

#[tokio::test]
async fn test_auth_missing() -> Result<()> {
    let (_service, server) = start_caster(&[("u", "p")]).await?;

    let response = request(server.local_addr(), "GET /BASE HTTP/1.1\r\n\r\n").await?;
    assert!(response.starts_with("HTTP/1.1 401 Unauthorized"));
    assert!(response.contains("WWW-Authenticate: Basic realm=\"NTRIP\"\r\n"));

    Ok(())
}

#[tokio::test]
async fn test_auth_accepted_then_streams() -> Result<()> {
    let (service, server) = start_caster(&[("u", "p")]).await?;

    // dTpw = base64("u:p")
    let (mut socket, head) = request_stream(
        server.local_addr(),
        "GET /BASE HTTP/1.1\r\nAuthorization: Basic dTpw\r\n\r\n",
    )
    .await?;

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: gnss/data\r\n"));

    wait_for_clients(&service, 1).await?;

    let correction = frame(&payload(1074, 32));
    service.publish(Bytes::from(correction.clone())).await;

    assert_eq!(read_exactly(&mut socket, correction.len()).await?, correction);

    Ok(())
}

#[tokio::test]
async fn test_broadcast_fanout() -> Result<()> {
    let (service, server) = start_caster(&[]).await?;
    let address = server.local_addr();

    let (mut first, _) = request_stream(address, "GET /BASE HTTP/1.1\r\n\r\n").await?;
    let (mut second, _) = request_stream(address, "GET /BASE HTTP/1.1\r\n\r\n").await?;
    wait_for_clients(&service, 2).await?;

    // The device stream arrives dirty: garbage, then a frame, then an
    // NMEA sentence, then another frame. Only the frames reach clients.
    let f1 = frame(&payload(1005, 19));
    let f2 = frame(&payload(1084, 64));

    let mut stream = vec![0x00, 0x42, 0x17];
    stream.extend_from_slice(&f1);
    stream.extend_from_slice(b"$GNGGA,123519.00,,,,,0,00,,,M,,M,,*00\r\n");
    stream.extend_from_slice(&f2);

    let mut framer = Framer::default();
    let validated: Vec<_> = framer.feed(&stream).collect();
    assert_eq!(validated.len(), 2);

    for frame in validated {
        service.publish(frame.into_bytes()).await;
    }

    let mut expected = f1.clone();
    expected.extend_from_slice(&f2);

    // Both subscribers receive exactly F1 || F2, byte-identical.
    assert_eq!(read_exactly(&mut first, expected.len()).await?, expected);
    assert_eq!(read_exactly(&mut second, expected.len()).await?, expected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_client_eviction() -> Result<()> {
    let (service, server) = start_caster(&[]).await?;
    let address = server.local_addr();

    // A drains continuously; B stops reading after admission.
    let (first, _) = request_stream(address, "GET /BASE HTTP/1.1\r\n\r\n").await?;
    let (second, _) = request_stream(address, "GET /BASE HTTP/1.1\r\n\r\n").await?;
    wait_for_clients(&service, 2).await?;

    let stalled_address = second.local_addr()?;

    let drained = tokio::spawn(async move {
        let mut socket = first;
        let mut buffer = [0u8; 4096];
        let mut total = 0u64;

        loop {
            match socket.read(&mut buffer).await {
                Ok(0) | Err(_) => return total,
                Ok(size) => total += size as u64,
            }
        }
    });

    // Publishing fills B's socket buffers; once they are full the timed
    // write gives up and that broadcast evicts B. A keeps draining and
    // stays subscribed.
    let correction = Bytes::from(frame(&payload(1074, 1021)));
    let evicted = timeout(Duration::from_secs(30), async {
        while service.sessions().len() == 2 {
            service.publish(correction.clone()).await;
        }
    })
    .await;

    assert!(evicted.is_ok(), "stalled subscriber was never evicted");

    let snapshot = service.sessions().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_ne!(snapshot[0].address, stalled_address);

    // The surviving subscriber still receives frames.
    service.publish(correction.clone()).await;

    // Orderly stop: close the listener, drop every subscriber, then
    // give the connection tasks a bounded grace period.
    server.close();
    service.shutdown();
    server.wait(Duration::from_secs(2)).await;

    let total = timeout(Duration::from_secs(5), drained).await??;
    assert!(total > 0);
    assert_eq!(total % correction.len() as u64, 0);

    // The listener is really closed.
    assert!(TcpStream::connect(address).await.is_err());

    drop(second);
    Ok(())
}
