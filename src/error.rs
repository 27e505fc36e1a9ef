//! Error Types
//!
//! Typed errors for the relay, the per-connection pump and the listener.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a relay stream.
///
/// Cloneable so that a terminal error can be handed to every pending reader
/// and writer of a failed stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The initial handshake with the relay was rejected.
    #[error("failed to connect to relay: {0}")]
    ConnectFailed(String),

    /// The relay denied access for this credential and target.
    #[error("access denied by relay: {0}")]
    AccessDenied(String),

    /// Connecting (or one reconnect attempt) did not complete in time.
    #[error("relay connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The connection dropped and could not be resumed.
    #[error("reconnect failed after {attempts} attempt(s): {reason}")]
    ReconnectExhausted { attempts: u32, reason: String },

    /// A frame was malformed, oversized or out of sequence.
    #[error("relay protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream closed")]
    StreamClosed,

    /// The credential provider failed to produce a token.
    #[error("credential unavailable: {0}")]
    Credential(String),

    /// The underlying framed connection failed.
    #[error("relay transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether a failed reconnect attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectFailed(_)
                | RelayError::ConnectTimeout(_)
                | RelayError::Transport(_)
                | RelayError::Credential(_)
        )
    }
}

/// Errors that end a single relayed connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("local socket error: {0}")]
    LocalSocket(#[from] io::Error),

    #[error("session cancelled")]
    Cancelled,
}

/// Errors that are fatal to a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}
