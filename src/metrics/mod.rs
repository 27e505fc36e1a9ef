//! Metrics Module
//!
//! Tunnel-wide and per-connection traffic counters, plus an optional
//! Prometheus scrape endpoint.

pub mod collector;
pub mod server;
pub mod types;

pub use collector::NetworkStatistics;
pub use server::MetricsServer;
pub use types::{ConnectionSnapshot, ConnectionStatistics, StatisticsSnapshot};
