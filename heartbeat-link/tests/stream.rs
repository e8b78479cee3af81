//! Integration tests for `StreamConnection`.
//!
//! Each test builds a real TCP pair on loopback.  One side is usually a plain
//! `tokio::net::TcpStream` so the test controls exactly which bytes go over
//! the wire; the other is the connection under test.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use heartbeat_link::{Connection, ConnectionState, LinkConfig, LinkError, Packet, StreamConnection};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Connected `(client, server)` pair of raw streams on loopback.
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .expect("bind listener");
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.expect("connect"), accepted.expect("accept").0)
}

/// Delivered packet, copied out of the reused buffer.
#[derive(Debug)]
struct Delivery {
    buffer_len: usize,
    len: usize,
    payload: Vec<u8>,
}

fn collector() -> (
    impl Fn(&Packet<'_>) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Delivery>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |p: &Packet<'_>| {
        let _ = tx.send(Delivery {
            buffer_len: p.buffer.len(),
            len: p.len,
            payload: p.payload().to_vec(),
        });
    };
    (handler, rx)
}

fn ignore(_: &Packet<'_>) {}

async fn receive_within(conn: &StreamConnection) -> heartbeat_link::Result<()> {
    timeout(Duration::from_secs(5), conn.receive())
        .await
        .expect("receive timed out")
}

// ---------------------------------------------------------------------------
// Receiving and classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_trip_reports_valid_length() {
    let (mut raw, server) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let conn = StreamConnection::new(server, LinkConfig::default(), handler).unwrap();

    raw.write_all(b"XYZ").await.unwrap();
    receive_within(&conn).await.expect("receive");

    let got = rx.try_recv().expect("payload delivered");
    assert_eq!(got.payload, b"XYZ");
    assert_eq!(got.len, 3);
    assert_eq!(got.buffer_len, 1024);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn heartbeat_marker_is_swallowed() {
    let (mut raw, server) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let conn = StreamConnection::new(server, LinkConfig::default(), handler).unwrap();

    raw.write_all(&[0xFF]).await.unwrap();
    receive_within(&conn).await.expect("receive heartbeat");
    assert!(rx.try_recv().is_err(), "heartbeat must not reach the handler");

    // Same first byte, different length: this is data.
    raw.write_all(&[0xFF, 0xFF]).await.unwrap();
    receive_within(&conn).await.expect("receive data");
    let got = rx.try_recv().expect("two-byte payload delivered");
    assert_eq!(got.payload, vec![0xFF, 0xFF]);
    assert_eq!(got.len, 2);

    // Same length, different content: also data.
    raw.write_all(&[0xFE]).await.unwrap();
    receive_within(&conn).await.expect("receive data");
    assert_eq!(rx.try_recv().expect("delivered").payload, vec![0xFE]);
}

#[tokio::test]
async fn custom_heartbeat_marker_is_honoured() {
    let (mut raw, server) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let conn = StreamConnection::new(server, LinkConfig::default(), handler).unwrap();
    conn.set_heartbeat_data(b"beat".to_vec());
    assert_eq!(conn.heartbeat_data(), b"beat");

    raw.write_all(b"beat").await.unwrap();
    receive_within(&conn).await.unwrap();
    assert!(rx.try_recv().is_err());

    raw.write_all(&[0xFF]).await.unwrap();
    receive_within(&conn).await.unwrap();
    assert_eq!(rx.try_recv().expect("old marker is now data").payload, vec![0xFF]);
}

#[tokio::test]
async fn changing_capacity_reallocates_buffer() {
    let (mut raw, server) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let conn = StreamConnection::new(server, LinkConfig::default(), handler).unwrap();
    conn.set_max_receivable_bytes(2);
    assert_eq!(conn.max_receivable_bytes(), 2);

    raw.write_all(b"XYZ").await.unwrap();
    receive_within(&conn).await.unwrap();
    let first = rx.try_recv().expect("first read");
    assert_eq!(first.payload, b"XY");
    assert_eq!(first.buffer_len, 2);

    receive_within(&conn).await.unwrap();
    let second = rx.try_recv().expect("second read");
    assert_eq!(second.payload, b"Z");
    assert_eq!(second.len, 1);
}

// ---------------------------------------------------------------------------
// Closure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_close_returns_cleanly_and_disconnects() {
    let (raw, server) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let conn = StreamConnection::new(server, LinkConfig::default(), handler).unwrap();

    drop(raw);
    receive_within(&conn).await.expect("peer close is not an error");

    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn receive_after_local_dispose_is_an_error() {
    let (_raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();

    conn.dispose().await.expect("dispose");
    let result = conn.receive().await;
    assert!(matches!(result, Err(LinkError::Closed)), "got {result:?}");
}

#[tokio::test]
async fn dispose_unblocks_in_flight_receive() {
    let (_raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();

    let receiver = conn.clone();
    let pending = tokio::spawn(async move { receiver.receive().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.dispose().await.expect("dispose");
    let result = timeout(Duration::from_secs(2), pending)
        .await
        .expect("receive stayed blocked")
        .expect("receive task panicked");
    assert!(result.is_ok(), "in-flight receive should end cleanly, got {result:?}");
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn dispose_twice_is_harmless() {
    let (mut raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();

    assert!(conn.dispose().await.is_ok());
    assert!(conn.dispose().await.is_ok());
    assert!(!conn.is_connected());

    // The peer sees an orderly end of stream.
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), raw.read(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn send_after_dispose_is_an_error() {
    let (_raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();
    conn.dispose().await.unwrap();

    assert!(matches!(conn.send(b"late").await, Err(LinkError::Closed)));
}

#[tokio::test]
async fn send_reaches_peer() {
    let (mut raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();
    assert_eq!(conn.peer_addr(), raw.local_addr().unwrap());

    conn.send(b"hello").await.expect("send");
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), raw.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf, b"hello");
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_cadence_matches_interval() {
    let (mut raw, server) = tcp_pair().await;
    let config = LinkConfig::default().with_heartbeat_interval(Duration::from_millis(500));
    let conn = StreamConnection::new(server, config, ignore).unwrap();

    conn.set_maintain_heartbeat(true);
    let start = Instant::now();
    let deadline = start + Duration::from_millis(1250);

    let mut arrivals = Vec::new();
    let mut buf = [0u8; 16];
    while let Ok(read) = tokio::time::timeout_at(deadline, raw.read(&mut buf)).await {
        let n = read.expect("read");
        assert!(n > 0, "unexpected end of stream");
        for &byte in &buf[..n] {
            assert_eq!(byte, 0xFF);
            arrivals.push(start.elapsed());
        }
    }

    assert_eq!(arrivals.len(), 2, "arrivals: {arrivals:?}");
    let gap = arrivals[1] - arrivals[0];
    assert!(
        gap >= Duration::from_millis(400) && gap <= Duration::from_millis(600),
        "heartbeats {gap:?} apart"
    );
    conn.dispose().await.unwrap();
}

#[tokio::test]
async fn heartbeat_toggle_is_idempotent() {
    let (_raw, server) = tcp_pair().await;
    let conn = StreamConnection::new(server, LinkConfig::default(), ignore).unwrap();

    assert!(!conn.maintains_heartbeat());
    conn.set_maintain_heartbeat(false);
    assert!(!conn.maintains_heartbeat());

    conn.set_maintain_heartbeat(true);
    conn.set_maintain_heartbeat(true);
    assert!(conn.maintains_heartbeat());

    conn.set_maintain_heartbeat(false);
    conn.set_maintain_heartbeat(false);
    assert!(!conn.maintains_heartbeat());
    assert!(conn.is_connected(), "stopping the heartbeat keeps the connection");
}

#[tokio::test]
async fn heartbeat_from_config_starts_immediately() {
    let (mut raw, server) = tcp_pair().await;
    let config = LinkConfig::default()
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_heartbeat(true);
    let conn = StreamConnection::new(server, config, ignore).unwrap();
    assert!(conn.maintains_heartbeat());

    let mut buf = [0u8; 1];
    timeout(Duration::from_secs(2), raw.read_exact(&mut buf))
        .await
        .expect("no heartbeat arrived")
        .unwrap();
    assert_eq!(buf, [0xFF]);
}

#[tokio::test]
async fn failed_heartbeat_send_disconnects() {
    let (raw, server) = tcp_pair().await;
    let config = LinkConfig::default().with_heartbeat_interval(Duration::from_millis(100));
    let conn = StreamConnection::new(server, config, ignore).unwrap();
    conn.set_maintain_heartbeat(true);

    // The first write after the peer is gone draws a reset, a later one fails.
    drop(raw);
    let gone = timeout(Duration::from_secs(5), async {
        while conn.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(gone.is_ok(), "heartbeat never noticed the dead peer");
    assert!(!conn.maintains_heartbeat());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropping_every_handle_closes_the_socket() {
    let (mut raw, server) = tcp_pair().await;
    let config = LinkConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat(true);
    let conn = StreamConnection::new(server, config, ignore).unwrap();
    drop(conn);

    // The heartbeat does not keep the connection alive: the peer reads
    // end of stream, possibly after a marker that was already in flight.
    let mut buf = [0u8; 16];
    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match raw.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => assert!(buf[..n].iter().all(|&b| b == 0xFF)),
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket stayed open after the last handle was dropped");
}

#[tokio::test]
async fn heartbeats_between_two_connections_stay_invisible() {
    let (client_raw, server_raw) = tcp_pair().await;
    let (handler, mut rx) = collector();
    let receiver = StreamConnection::new(server_raw, LinkConfig::default(), handler).unwrap();
    let sender = StreamConnection::new(
        client_raw,
        LinkConfig::default()
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_heartbeat(true),
        ignore,
    )
    .unwrap();

    let looped = receiver.clone();
    let receive_loop = tokio::spawn(async move {
        while looped.is_connected() {
            looped.receive().await.expect("receive");
        }
    });

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(rx.try_recv().is_err(), "heartbeats leaked to the handler");

    // Stop beating first so the message cannot share a read with a marker.
    sender.set_maintain_heartbeat(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    sender.send(b"hi").await.unwrap();
    let got = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message not delivered")
        .expect("channel closed");
    assert_eq!(got.payload, b"hi");

    sender.dispose().await.unwrap();
    timeout(Duration::from_secs(2), receive_loop)
        .await
        .expect("receive loop did not end")
        .unwrap();
    assert!(!receiver.is_connected());
}
