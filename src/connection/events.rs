//! Tunnel Events

use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the per-tunnel event channel. Slow subscribers lag and skip
/// events rather than blocking the tunnel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened on a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A client passed the policy check and a session is starting
    ClientAccepted { connection_id: u64, remote_addr: SocketAddr },
    /// A client was turned away by the connection policy
    ClientRejected { remote_addr: SocketAddr },
    /// A session ended without error
    SessionClosed {
        connection_id: u64,
        remote_addr: SocketAddr,
        bytes_sent: u64,
        bytes_received: u64,
    },
    /// A session ended with an error
    SessionFailed {
        connection_id: u64,
        remote_addr: SocketAddr,
        error: String,
    },
    /// The listener stopped accepting and all its sessions have finished
    ListenerStopped { accepted: u64, rejected: u64 },
}

/// Publishing side of a tunnel's event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: TunnelEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("Tunnel event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}
