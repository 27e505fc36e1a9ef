//! Metrics Types

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

/// Byte counters for one local socket.
///
/// `bytes_received` counts bytes read from the local client, `bytes_sent`
/// bytes written back to it. Both only ever grow.
#[derive(Debug)]
pub struct ConnectionStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    start_time: Instant,
}

impl ConnectionStatistics {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            duration_ms: self.duration().as_millis() as u64,
        }
    }
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`ConnectionStatistics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration_ms: u64,
}

/// Serializable view of the tunnel-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_failed: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_statistics() {
        let stats = ConnectionStatistics::new();
        assert_eq!(stats.bytes_sent(), 0);
        assert_eq!(stats.bytes_received(), 0);

        stats.record_received(100);
        stats.record_sent(40);
        stats.record_sent(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_received, 100);
        assert_eq!(snapshot.bytes_sent, 42);
    }
}
