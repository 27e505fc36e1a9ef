//! WebSocket Relay Channel

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::channel::{ChannelMessage, RelayChannel, RelayConnector, RelayRequest};
use crate::error::RelayError;
use crate::protocol::constants::CLOSE_NO_STATUS;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens relay connections over secure WebSockets
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, request: RelayRequest) -> Result<Box<dyn RelayChannel>, RelayError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::InvalidArgument(format!("invalid relay request: {}", e)))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::InvalidArgument(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RelayError::InvalidArgument(format!("invalid value for header {}: {}", name, e)))?;
            ws_request.headers_mut().insert(name, value);
        }

        if let Some(subprotocol) = &request.subprotocol {
            let value = HeaderValue::from_str(subprotocol)
                .map_err(|e| RelayError::InvalidArgument(format!("invalid subprotocol: {}", e)))?;
            ws_request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }

        debug!(host = ?request.url.host_str(), path = %request.url.path(), "Opening relay WebSocket");

        match connect_async(ws_request).await {
            Ok((ws, response)) => {
                debug!(status = %response.status(), "Relay WebSocket established");
                Ok(Box::new(WebSocketChannel { ws }))
            }
            Err(WsError::Http(response)) => {
                let status = response.status();
                warn!(status = %status, "Relay rejected WebSocket upgrade");
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    Err(RelayError::AccessDenied(format!("relay responded with HTTP {}", status)))
                } else {
                    Err(RelayError::ConnectFailed(format!("relay responded with HTTP {}", status)))
                }
            }
            Err(e) => Err(RelayError::ConnectFailed(e.to_string())),
        }
    }
}

/// A relay connection carried by a WebSocket
pub struct WebSocketChannel {
    ws: WsStream,
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel").finish_non_exhaustive()
    }
}

#[async_trait]
impl RelayChannel for WebSocketChannel {
    async fn send(&mut self, message: Bytes) -> Result<(), RelayError> {
        self.ws
            .send(Message::Binary(message.to_vec()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<ChannelMessage>, RelayError> {
        loop {
            match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(ChannelMessage::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    return Ok(Some(ChannelMessage::Close { code, reason }));
                }
                Some(Ok(Message::Text(text))) => {
                    warn!(len = text.len(), "Ignoring text message from relay");
                }
                // Pings are answered by tungstenite
                Some(Ok(other)) => {
                    trace!(kind = ?std::mem::discriminant(&other), "Ignoring control message");
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(RelayError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!("Error closing relay WebSocket: {}", e);
        }
    }
}
