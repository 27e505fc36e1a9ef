//! iaptunnel Library
//!
//! Forwards local TCP connections to a VM port through the IAP relay. Each
//! accepted client gets its own relay session: a framed, acknowledged byte
//! stream carried over a WebSocket that survives connection drops by
//! resuming the session and replaying unacknowledged data.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod security;
pub mod shutdown;
pub mod target;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use connection::{Listener, ListenerSummary, TunnelEvent};
pub use error::{ListenerError, RelayError, SessionError};
pub use metrics::NetworkStatistics;
pub use relay::{RelayClient, RelayStream};
pub use security::ConnectionPolicy;
pub use shutdown::ShutdownCoordinator;
pub use target::{InstanceLocator, RelayEndpoint, Target};
pub use tunnel::{Tunnel, TunnelFlags, TunnelOptions};

/// Common error type for configuration and the binary
pub type Result<T> = anyhow::Result<T>;
