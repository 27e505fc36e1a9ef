//! Relay Frame Codec
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +-----+----------+----------------+
//! | TAG |  LENGTH  |    PAYLOAD     |   CONNECT_SUCCESS_SID, DATA
//! |  2  |    4     |  LENGTH bytes  |
//! +-----+----------+----------------+
//! | TAG |   ACK    |                    RECONNECT_SUCCESS_ACK, ACK
//! |  2  |    8     |
//! +-----+----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use super::constants::*;
use super::types::Frame;
use crate::error::RelayError;

/// Encode a frame for transmission
pub fn encode(frame: &Frame) -> Result<Bytes, RelayError> {
    match frame {
        Frame::ConnectSuccessSid(sid) => {
            if sid.len() > MAX_SID_LEN {
                return Err(RelayError::ProtocolViolation(format!("session id of {} bytes is too long", sid.len())));
            }
            Ok(encode_with_length(TAG_CONNECT_SUCCESS_SID, sid.as_bytes()))
        }
        Frame::ReconnectSuccessAck(ack) => Ok(encode_with_ack(TAG_RECONNECT_SUCCESS_ACK, *ack)),
        Frame::Data(payload) => encode_data(payload),
        Frame::Ack(ack) => Ok(encode_ack(*ack)),
        Frame::Close { .. } => Err(RelayError::InvalidArgument(
            "CLOSE is carried by the transport and has no frame encoding".to_string(),
        )),
    }
}

/// Encode a DATA frame
pub fn encode_data(payload: &[u8]) -> Result<Bytes, RelayError> {
    if payload.len() > MAX_DATA_LEN {
        return Err(RelayError::InvalidArgument(format!(
            "DATA payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_DATA_LEN
        )));
    }
    Ok(encode_with_length(TAG_DATA, payload))
}

/// Encode an ACK frame
pub fn encode_ack(ack: u64) -> Bytes {
    encode_with_ack(TAG_ACK, ack)
}

/// Decode a binary message received from the relay.
///
/// Returns `Ok(None)` for frames with tags this client does not handle.
pub fn decode(message: Bytes) -> Result<Option<Frame>, RelayError> {
    if message.len() < TAG_LEN {
        return Err(RelayError::ProtocolViolation(format!("frame of {} bytes has no tag", message.len())));
    }

    let mut buf = message;
    let tag = buf.get_u16();

    let frame = match tag {
        TAG_CONNECT_SUCCESS_SID => {
            let sid = read_length_prefixed(&mut buf, MAX_SID_LEN, "CONNECT_SUCCESS_SID")?;
            let sid = String::from_utf8(sid.to_vec())
                .map_err(|e| RelayError::ProtocolViolation(format!("session id is not valid UTF-8: {}", e)))?;
            Frame::ConnectSuccessSid(sid)
        }
        TAG_RECONNECT_SUCCESS_ACK => {
            Frame::ReconnectSuccessAck(read_ack(&mut buf, "RECONNECT_SUCCESS_ACK")?)
        }
        TAG_DATA => Frame::Data(read_length_prefixed(&mut buf, MAX_DATA_LEN, "DATA")?),
        TAG_ACK => Frame::Ack(read_ack(&mut buf, "ACK")?),
        other => {
            debug!("Discarding frame with unsupported tag 0x{:04x}", other);
            return Ok(None);
        }
    };

    Ok(Some(frame))
}

fn encode_with_length(tag: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + LENGTH_FIELD_LEN + payload.len());
    buf.put_u16(tag);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

fn encode_with_ack(tag: u16, ack: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + ACK_FIELD_LEN);
    buf.put_u16(tag);
    buf.put_u64(ack);
    buf.freeze()
}

fn read_length_prefixed(buf: &mut Bytes, max_len: usize, name: &str) -> Result<Bytes, RelayError> {
    if buf.remaining() < LENGTH_FIELD_LEN {
        return Err(RelayError::ProtocolViolation(format!("{} frame is missing its length field", name)));
    }

    let len = buf.get_u32() as usize;
    if len > max_len {
        return Err(RelayError::ProtocolViolation(format!(
            "{} frame declares {} bytes, limit is {}",
            name,
            len,
            max_len
        )));
    }
    if buf.remaining() != len {
        return Err(RelayError::ProtocolViolation(format!(
            "{} frame declares {} bytes but carries {}",
            name,
            len,
            buf.remaining()
        )));
    }

    Ok(buf.split_to(len))
}

fn read_ack(buf: &mut Bytes, name: &str) -> Result<u64, RelayError> {
    if buf.remaining() != ACK_FIELD_LEN {
        return Err(RelayError::ProtocolViolation(format!(
            "{} frame must carry {} bytes, got {}",
            name,
            ACK_FIELD_LEN,
            buf.remaining()
        )));
    }
    Ok(buf.get_u64())
}
