//! Tunnel Statistics Collector

use prometheus::{IntCounter, Registry, TextEncoder};
use tracing::error;

use super::types::StatisticsSnapshot;

/// Cumulative counters for one tunnel.
///
/// Shared by the listener, every session pump and every relay stream of the
/// tunnel. All updates are atomic increments.
pub struct NetworkStatistics {
    registry: Registry,

    bytes_sent: IntCounter,
    bytes_received: IntCounter,
    frames_sent: IntCounter,
    frames_received: IntCounter,
    connections_accepted: IntCounter,
    connections_rejected: IntCounter,
    connections_failed: IntCounter,
    reconnects: IntCounter,
}

impl NetworkStatistics {
    /// Create a new set of counters with its own registry
    pub fn new() -> Self {
        let registry = Registry::new();

        let bytes_sent = counter(&registry, "iaptunnel_bytes_sent_total", "Payload bytes sent to the relay");
        let bytes_received = counter(
            &registry,
            "iaptunnel_bytes_received_total",
            "Payload bytes received from the relay",
        );
        let frames_sent = counter(&registry, "iaptunnel_frames_sent_total", "Frames sent to the relay");
        let frames_received = counter(
            &registry,
            "iaptunnel_frames_received_total",
            "Frames received from the relay",
        );
        let connections_accepted = counter(
            &registry,
            "iaptunnel_connections_accepted_total",
            "Local connections accepted for relaying",
        );
        let connections_rejected = counter(
            &registry,
            "iaptunnel_connections_rejected_total",
            "Local connections rejected by policy",
        );
        let connections_failed = counter(
            &registry,
            "iaptunnel_connections_failed_total",
            "Relayed connections that ended with an error",
        );
        let reconnects = counter(
            &registry,
            "iaptunnel_reconnects_total",
            "Successful relay reconnects",
        );

        Self {
            registry,
            bytes_sent,
            bytes_received,
            frames_sent,
            frames_received,
            connections_accepted,
            connections_rejected,
            connections_failed,
            reconnects,
        }
    }

    pub fn record_data_sent(&self, bytes: usize) {
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn record_data_received(&self, bytes: usize) {
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.inc();
    }

    pub fn record_frame_received(&self) {
        self.frames_received.inc();
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.inc();
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.inc();
    }

    pub fn record_failed(&self) {
        self.connections_failed.inc();
    }

    pub fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.get()
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.get()
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.get()
    }

    pub fn connections_failed(&self) -> u64 {
        self.connections_failed.get()
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.get()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            frames_sent: self.frames_sent.get(),
            frames_received: self.frames_received.get(),
            connections_accepted: self.connections_accepted.get(),
            connections_rejected: self.connections_rejected.get(),
            connections_failed: self.connections_failed.get(),
            reconnects: self.reconnects.get(),
        }
    }

    /// Render all counters in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}

impl Default for NetworkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStatistics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help)
        .unwrap_or_else(|e| panic!("invalid counter definition {}: {}", name, e));
    registry
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("failed to register {}: {}", name, e));
    counter
}
