//! Relay Protocol Implementation
//!
//! Frame layout, constants and the codec for the relay's framed protocol.

pub mod codec;
pub mod constants;
pub mod types;

pub use codec::{decode, encode, encode_ack, encode_data};
pub use constants::*;
pub use types::*;
