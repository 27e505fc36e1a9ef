//! Relay Protocol Types

use bytes::Bytes;

use crate::error::RelayError;
use crate::protocol::constants::*;

/// A unit on the relay wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sent by the relay once the backend connection is established.
    ConnectSuccessSid(String),
    /// Sent by the relay after a successful reconnect; carries the number of
    /// bytes the relay has received from us in this session.
    ReconnectSuccessAck(u64),
    Data(Bytes),
    /// Cumulative count of bytes received by the sender of this frame.
    Ack(u64),
    /// Close of the underlying connection, with the relay close code.
    Close { code: u16, reason: String },
}

impl Frame {
    /// Get the wire tag for this frame, if it has one
    pub fn tag(&self) -> Option<u16> {
        match self {
            Frame::ConnectSuccessSid(_) => Some(TAG_CONNECT_SUCCESS_SID),
            Frame::ReconnectSuccessAck(_) => Some(TAG_RECONNECT_SUCCESS_ACK),
            Frame::Data(_) => Some(TAG_DATA),
            Frame::Ack(_) => Some(TAG_ACK),
            Frame::Close { .. } => None,
        }
    }

    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Frame::ConnectSuccessSid(_) => "CONNECT_SUCCESS_SID",
            Frame::ReconnectSuccessAck(_) => "RECONNECT_SUCCESS_ACK",
            Frame::Data(_) => "DATA",
            Frame::Ack(_) => "ACK",
            Frame::Close { .. } => "CLOSE",
        }
    }
}

/// What a close code means for the stream that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// End of stream. Reads return EOF.
    Orderly,
    /// The connection was lost but the session may be resumed.
    Reconnect,
    /// The relay could not reach the backend.
    ConnectFailed,
    AccessDenied,
    /// The session id is no longer usable.
    SessionLost,
    ProtocolViolation,
}

impl CloseDisposition {
    /// Classify a relay close code
    pub fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL | CLOSE_DESTINATION_READ_FAILED | CLOSE_DESTINATION_WRITE_FAILED => {
                CloseDisposition::Orderly
            }
            CLOSE_FAILED_TO_CONNECT_TO_BACKEND | CLOSE_LOOKUP_FAILED | CLOSE_LOOKUP_FAILED_RECONNECT => {
                CloseDisposition::ConnectFailed
            }
            CLOSE_NOT_AUTHORIZED => CloseDisposition::AccessDenied,
            CLOSE_SID_UNKNOWN | CLOSE_SID_IN_USE => CloseDisposition::SessionLost,
            CLOSE_BAD_ACK
            | CLOSE_INVALID_ACK
            | CLOSE_INVALID_WEBSOCKET_OPCODE
            | CLOSE_INVALID_TAG
            | CLOSE_INVALID_DATA => CloseDisposition::ProtocolViolation,
            _ => CloseDisposition::Reconnect,
        }
    }

    /// Turn a non-orderly, non-retryable close into the error it represents
    pub fn into_error(self, code: u16, reason: &str) -> Option<RelayError> {
        let detail = if reason.is_empty() {
            format!("close code {}", code)
        } else {
            format!("close code {}: {}", code, reason)
        };

        match self {
            CloseDisposition::Orderly | CloseDisposition::Reconnect => None,
            CloseDisposition::ConnectFailed => Some(RelayError::ConnectFailed(detail)),
            CloseDisposition::AccessDenied => Some(RelayError::AccessDenied(detail)),
            CloseDisposition::SessionLost => Some(RelayError::ReconnectExhausted {
                attempts: 0,
                reason: detail,
            }),
            CloseDisposition::ProtocolViolation => Some(RelayError::ProtocolViolation(detail)),
        }
    }
}
