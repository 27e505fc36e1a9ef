//! Transport Module
//!
//! Byte carriers on both sides of a tunnel: the framed relay connection and
//! the local client socket.

pub mod channel;
pub mod socket;
pub mod websocket;

pub use channel::{ChannelMessage, RelayChannel, RelayConnector, RelayRequest};
pub use socket::{SocketReader, SocketTransport, SocketWriter};
pub use websocket::{WebSocketChannel, WebSocketConnector};
