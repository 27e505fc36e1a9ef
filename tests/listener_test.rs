//! Integration tests for the tunnel listener

mod common;

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use common::{fast_config, test_target, MockRelay};
use iaptunnel::connection::EventSender;
use iaptunnel::{ConnectionPolicy, Listener, ListenerSummary, TunnelEvent};

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<TunnelEvent>) -> TunnelEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a tunnel event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_rejected_client_never_reaches_relay() {
    let relay = MockRelay::new();
    let client = relay.client(fast_config());
    let connector = relay.connector();

    let events = EventSender::new();
    let mut rx = events.subscribe();
    let listener = Listener::bind(any_port(), client, test_target())
        .await
        .unwrap()
        .with_policy(ConnectionPolicy::custom(|_| false))
        .with_events(events);
    let addr = listener.local_addr();
    let statistics = listener.statistics().clone();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.listen(cancel.clone()));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    match next_event(&mut rx).await {
        TunnelEvent::ClientRejected { remote_addr } => {
            assert_eq!(remote_addr, socket.local_addr().unwrap());
        }
        other => panic!("expected ClientRejected, got {:?}", other),
    }

    // The socket is closed without any data
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), socket.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary, ListenerSummary { accepted: 0, rejected: 1 });
    assert_eq!(connector.connect_count(), 0);
    assert_eq!(statistics.connections_rejected(), 1);
    assert_eq!(statistics.connections_accepted(), 0);
}

#[tokio::test]
async fn test_accept_limit_stops_listener() {
    let relay = MockRelay::new();
    let client = relay.client(fast_config());
    let (connector, stop) = relay.spawn_echo();

    let listener = Listener::bind(any_port(), client, test_target())
        .await
        .unwrap()
        .with_accept_limit(Some(1));
    let addr = listener.local_addr();
    let handle = tokio::spawn(listener.listen(CancellationToken::new()));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    // Ending the only session ends the listener
    drop(socket);
    let summary = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(connector.connect_count(), 1);

    // The listening socket is gone
    assert!(TcpStream::connect(addr).await.is_err());
    stop.cancel();
}

#[tokio::test]
async fn test_relay_refusal_closes_client() {
    let relay = MockRelay::new();
    let client = relay.client(fast_config());
    let (_connector, stop) = relay.spawn_refusing();

    let events = EventSender::new();
    let mut rx = events.subscribe();
    let listener = Listener::bind(any_port(), client, test_target())
        .await
        .unwrap()
        .with_events(events);
    let addr = listener.local_addr();
    let statistics = listener.statistics().clone();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.listen(cancel.clone()));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    assert!(matches!(next_event(&mut rx).await, TunnelEvent::ClientAccepted { connection_id: 1, .. }));
    match next_event(&mut rx).await {
        TunnelEvent::SessionFailed { connection_id, error, .. } => {
            assert_eq!(connection_id, 1);
            assert!(error.contains("4003"), "unexpected error: {}", error);
        }
        other => panic!("expected SessionFailed, got {:?}", other),
    }
    assert_eq!(statistics.connections_failed(), 1);

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.accepted, 1);
    stop.cancel();
}

#[tokio::test]
async fn test_large_transfer_round_trip() {
    let relay = MockRelay::new();
    let client = relay.client(fast_config());
    let (_connector, stop) = relay.spawn_echo();

    let events = EventSender::new();
    let mut rx = events.subscribe();
    let listener = Listener::bind(any_port(), client, test_target())
        .await
        .unwrap()
        .with_events(events);
    let addr = listener.local_addr();
    let statistics = listener.statistics().clone();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.listen(cancel.clone()));

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    let socket = TcpStream::connect(addr).await.unwrap();
    let (mut read_half, mut write_half) = socket.into_split();

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&to_send).await.unwrap();
        write_half
    });

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), read_half.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
    drop(writer.await.unwrap());

    assert!(matches!(next_event(&mut rx).await, TunnelEvent::ClientAccepted { .. }));
    match next_event(&mut rx).await {
        TunnelEvent::SessionClosed {
            bytes_sent,
            bytes_received,
            ..
        } => {
            assert_eq!(bytes_sent, payload.len() as u64);
            assert_eq!(bytes_received, payload.len() as u64);
        }
        other => panic!("expected SessionClosed, got {:?}", other),
    }

    assert_eq!(statistics.bytes_sent(), payload.len() as u64);
    assert_eq!(statistics.bytes_received(), payload.len() as u64);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    stop.cancel();
}

#[tokio::test]
async fn test_cancel_ends_active_sessions() {
    let relay = MockRelay::new();
    let client = relay.client(fast_config());
    let (_connector, stop) = relay.spawn_echo();

    let listener = Listener::bind(any_port(), client, test_target()).await.unwrap();
    let addr = listener.local_addr();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.listen(cancel.clone()));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await.unwrap();

    cancel.cancel();
    let summary = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.accepted, 1);

    // The client sees the session end
    let mut rest = [0u8; 8];
    let read = timeout(Duration::from_secs(2), socket.read(&mut rest)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    stop.cancel();
}

#[tokio::test]
async fn test_bind_error_names_address() {
    let relay = MockRelay::new();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let err = Listener::bind(addr, relay.client(fast_config()), test_target())
        .await
        .err()
        .expect("bind should fail");
    assert!(err.to_string().contains(&addr.to_string()));
}
