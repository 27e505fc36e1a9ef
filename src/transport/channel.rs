//! Framed Relay Channels
//!
//! The relay stream only needs a message-oriented connection that can be
//! opened with a URL and headers, send binary messages, receive binary
//! messages or a close code, and be closed. [`RelayConnector`] and
//! [`RelayChannel`] describe that capability so the stream can run over a
//! WebSocket in production and over an in-memory pair in tests.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::RelayError;

/// A request to open a relay connection
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub subprotocol: Option<String>,
}

impl RelayRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            subprotocol: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    /// Look up a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a query parameter of the request URL
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// A message received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// Opens framed connections to the relay
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, request: RelayRequest) -> Result<Box<dyn RelayChannel>, RelayError>;
}

/// One framed connection to the relay
#[async_trait]
pub trait RelayChannel: Send {
    async fn send(&mut self, message: Bytes) -> Result<(), RelayError>;

    /// Receive the next message. `Ok(None)` means the connection ended
    /// without a close frame.
    ///
    /// Must be cancel-safe: the relay stream polls it inside `select!`.
    async fn receive(&mut self) -> Result<Option<ChannelMessage>, RelayError>;

    async fn close(&mut self, code: u16, reason: &str);
}
