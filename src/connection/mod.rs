//! Connection Module
//!
//! Local side of a tunnel: accepting clients, admitting them, and pumping
//! their bytes through relay streams.

pub mod events;
pub mod listener;
pub mod session;

pub use events::{EventSender, TunnelEvent};
pub use listener::{Listener, ListenerSummary};
pub use session::TunnelSession;
