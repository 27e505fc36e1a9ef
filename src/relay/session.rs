//! Relay Session
//!
//! Sequence bookkeeping for one relay session. Survives reconnects: only the
//! underlying channel is replaced, the counters and replay buffer carry over.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use tracing::trace;

use crate::error::RelayError;

/// Sequence counters and replay buffer of a relay session.
///
/// All counters are cumulative byte counts modulo 2^64 and are compared with
/// wrapping arithmetic.
#[derive(Debug)]
pub struct RelaySession {
    sid: String,
    bytes_sent: u64,
    bytes_acked: u64,
    bytes_received: u64,
    last_ack_sent: u64,
    replay: VecDeque<Bytes>,
}

impl RelaySession {
    pub fn new(sid: String) -> Self {
        Self {
            sid,
            bytes_sent: 0,
            bytes_acked: 0,
            bytes_received: 0,
            last_ack_sent: 0,
            replay: VecDeque::new(),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes sent but not yet acknowledged by the relay
    pub fn outstanding(&self) -> u64 {
        self.bytes_sent.wrapping_sub(self.bytes_acked)
    }

    /// Record a payload about to be sent. It stays in the replay buffer until
    /// acknowledged.
    pub fn record_sent(&mut self, payload: Bytes) {
        self.bytes_sent = self.bytes_sent.wrapping_add(payload.len() as u64);
        self.replay.push_back(payload);
    }

    /// Apply a cumulative acknowledgement from the relay and release the
    /// acknowledged prefix of the replay buffer.
    pub fn acknowledge(&mut self, ack: u64) -> Result<(), RelayError> {
        let advance = ack.wrapping_sub(self.bytes_acked);
        if advance > self.outstanding() {
            return Err(RelayError::ProtocolViolation(format!(
                "ack {} outside window [{}, {}]",
                ack, self.bytes_acked, self.bytes_sent
            )));
        }

        let mut remaining = advance;
        while remaining > 0 {
            let Some(front) = self.replay.front_mut() else {
                break;
            };
            let len = front.len() as u64;
            if len <= remaining {
                remaining -= len;
                self.replay.pop_front();
            } else {
                front.advance(remaining as usize);
                remaining = 0;
            }
        }

        self.bytes_acked = ack;
        trace!(sid = %self.sid, ack, outstanding = self.outstanding(), "Applied relay ack");
        Ok(())
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received = self.bytes_received.wrapping_add(bytes as u64);
    }

    /// Received bytes not yet covered by an ACK we sent
    pub fn unacknowledged_received(&self) -> u64 {
        self.bytes_received.wrapping_sub(self.last_ack_sent)
    }

    /// Mark everything received so far as acknowledged and return the ACK
    /// value to send.
    pub fn take_ack(&mut self) -> u64 {
        self.last_ack_sent = self.bytes_received;
        self.last_ack_sent
    }

    /// Unacknowledged payloads in send order
    pub fn replay_buffer(&self) -> impl Iterator<Item = &Bytes> {
        self.replay.iter()
    }

    pub fn replay_len(&self) -> usize {
        self.replay.iter().map(Bytes::len).sum()
    }
}
