//! Relay Module
//!
//! Reliable byte streams over the IAP relay: session bookkeeping, the stream
//! driver with flow control and reconnection, and the client that opens
//! streams.

pub mod backoff;
pub mod client;
pub mod session;
pub mod stream;

pub use backoff::Backoff;
pub use client::RelayClient;
pub use session::RelaySession;
pub use stream::{RelayReader, RelayStream, RelayWriter, StreamState};
