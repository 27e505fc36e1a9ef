//! Relay Client
//!
//! Opens relay streams to targets. Holds everything a stream needs to
//! (re)establish its connection: the endpoint, a connector, a credential
//! provider and the relay settings.

use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CredentialProvider;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::metrics::NetworkStatistics;
use crate::protocol::codec;
use crate::protocol::constants::RELAY_SUBPROTOCOL;
use crate::protocol::types::{CloseDisposition, Frame};
use crate::target::{RelayEndpoint, Target};
use crate::transport::{ChannelMessage, RelayChannel, RelayConnector, RelayRequest, WebSocketConnector};

use super::session::RelaySession;
use super::stream::RelayStream;

/// Factory for relay streams
#[derive(Clone)]
pub struct RelayClient {
    endpoint: RelayEndpoint,
    connector: Arc<dyn RelayConnector>,
    credential: Arc<dyn CredentialProvider>,
    config: RelayConfig,
    statistics: Arc<NetworkStatistics>,
}

impl RelayClient {
    pub fn new(
        endpoint: RelayEndpoint,
        connector: Arc<dyn RelayConnector>,
        credential: Arc<dyn CredentialProvider>,
        config: RelayConfig,
    ) -> Self {
        Self {
            endpoint,
            connector,
            credential,
            config,
            statistics: Arc::new(NetworkStatistics::new()),
        }
    }

    /// Create a client that talks to the configured endpoint over WebSockets
    pub fn from_config(config: &RelayConfig, credential: Arc<dyn CredentialProvider>) -> Result<Self, RelayError> {
        let endpoint = RelayEndpoint::new(&config.endpoint, config.user_agent.clone())?;
        Ok(Self::new(
            endpoint,
            Arc::new(WebSocketConnector::new()),
            credential,
            config.clone(),
        ))
    }

    /// Same client, recording traffic into `statistics`
    pub fn with_statistics(mut self, statistics: Arc<NetworkStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    /// Open a new relay session to `target`.
    ///
    /// Waits for the relay to report a session id, bounded by the connect
    /// timeout. Failures are returned as-is and not retried.
    pub async fn open(&self, target: &Target, cancel: CancellationToken) -> Result<RelayStream, RelayError> {
        let url = self.endpoint.connect_url(target);
        debug!(target = %target, "Opening relay session");

        let handshake = async {
            let mut channel = self.connect_channel(url).await?;
            match await_frame(channel.as_mut()).await? {
                Frame::ConnectSuccessSid(sid) => Ok((channel, sid)),
                other => Err(RelayError::ProtocolViolation(format!(
                    "expected CONNECT_SUCCESS_SID, got {}",
                    other.name()
                ))),
            }
        };

        let (channel, sid) = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::StreamClosed),
            result = timeout(self.config.connect_timeout, handshake) => match result {
                Ok(result) => result?,
                Err(_) => return Err(RelayError::ConnectTimeout(self.config.connect_timeout)),
            },
        };

        info!(target = %target, sid = %sid, "Relay session established");
        Ok(RelayStream::spawn(
            self.clone(),
            target.clone(),
            channel,
            RelaySession::new(sid),
            cancel.child_token(),
        ))
    }

    /// Resume an existing session on a fresh connection.
    ///
    /// Returns the new channel and the number of bytes the relay reports
    /// having received from us.
    pub(crate) async fn resume(
        &self,
        target: &Target,
        sid: &str,
        ack: u64,
    ) -> Result<(Box<dyn RelayChannel>, u64), RelayError> {
        let url = self.endpoint.reconnect_url(target, sid, ack);

        let handshake = async {
            let mut channel = self.connect_channel(url).await?;
            match await_frame(channel.as_mut()).await? {
                Frame::ReconnectSuccessAck(acked) => Ok((channel, acked)),
                other => Err(RelayError::ProtocolViolation(format!(
                    "expected RECONNECT_SUCCESS_ACK, got {}",
                    other.name()
                ))),
            }
        };

        match timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    async fn connect_channel(&self, url: Url) -> Result<Box<dyn RelayChannel>, RelayError> {
        let token = self.credential.access_token().await?;
        let request = RelayRequest::new(url)
            .with_header("Authorization", format!("Bearer {}", token))
            .with_header("Origin", self.endpoint.origin())
            .with_header("User-Agent", self.endpoint.user_agent())
            .with_subprotocol(RELAY_SUBPROTOCOL);

        self.connector.connect(request).await
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Wait for the first recognised frame of a handshake
async fn await_frame(channel: &mut dyn RelayChannel) -> Result<Frame, RelayError> {
    loop {
        match channel.receive().await? {
            Some(ChannelMessage::Binary(message)) => {
                if let Some(frame) = codec::decode(message)? {
                    return Ok(frame);
                }
            }
            Some(ChannelMessage::Close { code, reason }) => {
                warn!(code, reason = %reason, "Relay closed connection during handshake");
                return Err(CloseDisposition::from_code(code)
                    .into_error(code, &reason)
                    .unwrap_or_else(|| {
                        RelayError::ConnectFailed(format!("relay closed connection with code {}", code))
                    }));
            }
            None => {
                return Err(RelayError::Transport(
                    "relay connection ended during handshake".to_string(),
                ))
            }
        }
    }
}
