//! In-memory relay for integration tests
//!
//! `MockRelay` hands out a [`PeerHandle`] for every connection the client
//! opens. Tests drive the relay side of the protocol through the handle:
//! send frames, close with a code, or drop the connection outright.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use iaptunnel::auth::StaticCredential;
use iaptunnel::config::{FlowControlConfig, ReconnectConfig, RelayConfig};
use iaptunnel::protocol::{self, Frame, CLOSE_FAILED_TO_CONNECT_TO_BACKEND};
use iaptunnel::transport::{ChannelMessage, RelayChannel, RelayConnector, RelayRequest};
use iaptunnel::{InstanceLocator, RelayClient, RelayEndpoint, RelayError, RelayStream, Target};

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_SID: &str = "sid-1";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// What the relay side observes on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Frame(Frame),
    Closed(u16),
}

enum ToPeer {
    Message(Bytes),
    Closed(u16),
}

/// Connector handing connections to a [`MockRelay`]
pub struct MockConnector {
    incoming: mpsc::UnboundedSender<(RelayRequest, PeerHandle)>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn connect(&self, request: RelayRequest) -> Result<Box<dyn RelayChannel>, RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (to_client, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();

        let peer = PeerHandle { to_client, from_client };
        self.incoming
            .send((request, peer))
            .map_err(|_| RelayError::ConnectFailed("mock relay is gone".to_string()))?;

        Ok(Box::new(MockChannel { to_peer, from_peer }))
    }
}

struct MockChannel {
    to_peer: mpsc::UnboundedSender<ToPeer>,
    from_peer: mpsc::UnboundedReceiver<ChannelMessage>,
}

#[async_trait]
impl RelayChannel for MockChannel {
    async fn send(&mut self, message: Bytes) -> Result<(), RelayError> {
        self.to_peer
            .send(ToPeer::Message(message))
            .map_err(|_| RelayError::Transport("peer dropped connection".to_string()))
    }

    async fn receive(&mut self) -> Result<Option<ChannelMessage>, RelayError> {
        Ok(self.from_peer.recv().await)
    }

    async fn close(&mut self, code: u16, _reason: &str) {
        let _ = self.to_peer.send(ToPeer::Closed(code));
    }
}

/// Relay side of one connection
pub struct PeerHandle {
    to_client: mpsc::UnboundedSender<ChannelMessage>,
    from_client: mpsc::UnboundedReceiver<ToPeer>,
}

impl PeerHandle {
    pub fn send_frame(&self, frame: Frame) {
        let message = protocol::encode(&frame).expect("encodable frame");
        let _ = self.to_client.send(ChannelMessage::Binary(message));
    }

    pub fn send_sid(&self, sid: &str) {
        self.send_frame(Frame::ConnectSuccessSid(sid.to_string()));
    }

    pub fn send_reconnect_ack(&self, ack: u64) {
        self.send_frame(Frame::ReconnectSuccessAck(ack));
    }

    pub fn send_data(&self, payload: &[u8]) {
        self.send_frame(Frame::Data(Bytes::copy_from_slice(payload)));
    }

    pub fn send_ack(&self, ack: u64) {
        self.send_frame(Frame::Ack(ack));
    }

    pub fn send_raw(&self, message: Bytes) {
        let _ = self.to_client.send(ChannelMessage::Binary(message));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(ChannelMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Next event from the client, or `None` once the client dropped the
    /// connection
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        let message = timeout(STEP_TIMEOUT, self.from_client.recv())
            .await
            .expect("timed out waiting for the client")?;

        Some(match message {
            ToPeer::Message(bytes) => PeerEvent::Frame(
                protocol::decode(bytes)
                    .expect("client sent a valid frame")
                    .expect("client sent a known frame"),
            ),
            ToPeer::Closed(code) => PeerEvent::Closed(code),
        })
    }

    /// Whether the client has sent anything not yet consumed
    pub fn has_pending(&mut self) -> bool {
        match self.from_client.try_recv() {
            Ok(_) => true,
            Err(mpsc::error::TryRecvError::Empty) => false,
            Err(mpsc::error::TryRecvError::Disconnected) => false,
        }
    }

    /// Next DATA payload, skipping ACKs
    pub async fn next_data(&mut self) -> Bytes {
        loop {
            match self.next_event().await {
                Some(PeerEvent::Frame(Frame::Data(payload))) => return payload,
                Some(PeerEvent::Frame(Frame::Ack(_))) => continue,
                other => panic!("expected DATA, got {:?}", other),
            }
        }
    }

    /// Collect DATA payloads until `len` bytes have arrived
    pub async fn read_data(&mut self, len: usize) -> Vec<u8> {
        let mut received = Vec::with_capacity(len);
        while received.len() < len {
            received.extend_from_slice(&self.next_data().await);
        }
        received
    }
}

/// In-memory relay
pub struct MockRelay {
    connector: Arc<MockConnector>,
    incoming: mpsc::UnboundedReceiver<(RelayRequest, PeerHandle)>,
}

impl MockRelay {
    pub fn new() -> Self {
        let (tx, incoming) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(MockConnector {
                incoming: tx,
                connects: AtomicUsize::new(0),
            }),
            incoming,
        }
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        self.connector.clone()
    }

    pub fn client(&self, config: RelayConfig) -> RelayClient {
        RelayClient::new(
            RelayEndpoint::default(),
            self.connector.clone(),
            Arc::new(StaticCredential::new(TEST_TOKEN)),
            config,
        )
    }

    /// Wait for the client's next connection
    pub async fn accept(&mut self) -> (RelayRequest, PeerHandle) {
        timeout(STEP_TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a relay connection")
            .expect("connector dropped")
    }

    /// Serve every connection as an echo backend until the returned token
    /// is cancelled
    pub fn spawn_echo(self) -> (Arc<MockConnector>, CancellationToken) {
        self.spawn_with(|mut peer| async move {
            peer.send_sid(TEST_SID);
            let mut received = 0u64;
            while let Some(event) = peer.next_event_untimed().await {
                match event {
                    PeerEvent::Frame(Frame::Data(payload)) => {
                        received += payload.len() as u64;
                        peer.send_ack(received);
                        peer.send_frame(Frame::Data(payload));
                    }
                    PeerEvent::Frame(_) => {}
                    PeerEvent::Closed(_) => break,
                }
            }
        })
    }

    /// Refuse every connection as if the backend were unreachable
    pub fn spawn_refusing(self) -> (Arc<MockConnector>, CancellationToken) {
        self.spawn_with(|peer| async move {
            peer.close(CLOSE_FAILED_TO_CONNECT_TO_BACKEND, "failed to connect to backend");
            // Keep the handle until the client has seen the close
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
    }

    fn spawn_with<F, Fut>(mut self, serve: F) -> (Arc<MockConnector>, CancellationToken)
    where
        F: Fn(PeerHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let connector = self.connector.clone();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = self.incoming.recv() => match next {
                        Some((_request, peer)) => {
                            tokio::spawn(serve(peer));
                        }
                        None => break,
                    }
                }
            }
        });
        (connector, cancel)
    }
}

impl PeerHandle {
    async fn next_event_untimed(&mut self) -> Option<PeerEvent> {
        let message = self.from_client.recv().await?;
        match message {
            ToPeer::Message(bytes) => protocol::decode(bytes).ok().flatten().map(PeerEvent::Frame),
            ToPeer::Closed(code) => Some(PeerEvent::Closed(code)),
        }
    }
}

/// Relay settings with short timeouts
pub fn fast_config() -> RelayConfig {
    RelayConfig {
        connect_timeout: Duration::from_secs(2),
        ack_threshold: 1024,
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        },
        flow_control: FlowControlConfig {
            high_water_mark: 256 * 1024,
            low_water_mark: 128 * 1024,
        },
        ..RelayConfig::default()
    }
}

pub fn test_target() -> Target {
    Target::new(InstanceLocator::new("test-project", "us-central1-a", "vm-1"), 22)
}

/// Open a stream and complete the handshake from the relay side
pub async fn open_stream(relay: &mut MockRelay, client: &RelayClient) -> (RelayStream, RelayRequest, PeerHandle) {
    let target = test_target();
    let opener = {
        let client = client.clone();
        tokio::spawn(async move { client.open(&target, CancellationToken::new()).await })
    };

    let (request, peer) = relay.accept().await;
    peer.send_sid(TEST_SID);

    let stream = opener
        .await
        .expect("open task panicked")
        .expect("open should succeed");
    (stream, request, peer)
}
