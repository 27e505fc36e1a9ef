//! Local Socket Transport
//!
//! Wraps an accepted local TCP connection. Reads and writes take a
//! cancellation token so a session can be torn down while blocked on the
//! socket, and every transferred byte is counted in the connection's
//! [`ConnectionStatistics`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;
use crate::metrics::ConnectionStatistics;

/// An accepted local client connection
#[derive(Debug)]
pub struct SocketTransport {
    stream: TcpStream,
    remote_addr: SocketAddr,
    statistics: Arc<ConnectionStatistics>,
}

impl SocketTransport {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client_addr = %remote_addr, "Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            stream,
            remote_addr,
            statistics: Arc::new(ConnectionStatistics::new()),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn statistics(&self) -> Arc<ConnectionStatistics> {
        self.statistics.clone()
    }

    /// Split into halves that can be driven from concurrent copy loops
    pub fn into_split(self) -> (SocketReader, SocketWriter) {
        let (read, write) = self.stream.into_split();
        (
            SocketReader {
                inner: read,
                statistics: self.statistics.clone(),
            },
            SocketWriter {
                inner: write,
                statistics: self.statistics,
            },
        )
    }
}

/// Read half of a [`SocketTransport`]
#[derive(Debug)]
pub struct SocketReader {
    inner: OwnedReadHalf,
    statistics: Arc<ConnectionStatistics>,
}

impl SocketReader {
    /// Read from the client. `Ok(0)` means the client closed its side.
    pub async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, SessionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.inner.read(buf) => {
                let n = result?;
                self.statistics.record_received(n);
                Ok(n)
            }
        }
    }
}

/// Write half of a [`SocketTransport`]
#[derive(Debug)]
pub struct SocketWriter {
    inner: OwnedWriteHalf,
    statistics: Arc<ConnectionStatistics>,
}

impl SocketWriter {
    pub async fn write_all(&mut self, buf: &[u8], cancel: &CancellationToken) -> Result<(), SessionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.inner.write_all(buf) => {
                result?;
                self.statistics.record_sent(buf.len());
                Ok(())
            }
        }
    }

    /// Send FIN to the client
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (SocketTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (SocketTransport::new(server, peer), client)
    }

    #[tokio::test]
    async fn test_read_write_counts_bytes() {
        let (transport, mut client) = socket_pair().await;
        let statistics = transport.statistics();
        let (mut reader, mut writer) = transport.into_split();
        let cancel = CancellationToken::new();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        writer.write_all(b"world!", &cancel).await.unwrap();
        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world!");

        assert_eq!(statistics.bytes_received(), 5);
        assert_eq!(statistics.bytes_sent(), 6);
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let (transport, _client) = socket_pair().await;
        let (mut reader, _writer) = transport.into_split();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut buf = [0u8; 16];
        let result = reader.read(&mut buf, &cancel).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_signals_eof() {
        let (transport, mut client) = socket_pair().await;
        let (_reader, mut writer) = transport.into_split();
        writer.shutdown().await;

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
