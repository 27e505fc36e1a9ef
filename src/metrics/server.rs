//! Metrics HTTP Server
//!
//! Serves the tunnel counters for Prometheus scraping on `/metrics` and a
//! liveness check on `/health`.

use crate::metrics::NetworkStatistics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    statistics: Arc<NetworkStatistics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics endpoint
    pub async fn bind(statistics: Arc<NetworkStatistics>, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { statistics, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(bind_addr = ?self.listener.local_addr().ok(), "Metrics server started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Metrics server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(client_addr = %addr, "Metrics request received");

                        let statistics = self.statistics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut stream, statistics).await {
                                error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept metrics connection");
                    }
                }
            }
        }
    }
}

/// Handle a single HTTP request
async fn handle_request(stream: &mut TcpStream, statistics: Arc<NetworkStatistics>) -> anyhow::Result<()> {
    // Only the request line matters
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);

    let response = if request.starts_with("GET /metrics") {
        let body = statistics.export_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         Connection: close\r\n\
         \r\n\
         OK"
            .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 9\r\n\
         Connection: close\r\n\
         \r\n\
         Not Found"
            .to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoint() -> anyhow::Result<()> {
        let statistics = Arc::new(NetworkStatistics::new());
        statistics.record_accepted();

        let server = MetricsServer::bind(statistics, "127.0.0.1:0".parse()?).await?;
        let addr = server.local_addr()?;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200 OK"));
        assert!(metrics.contains("iaptunnel_connections_accepted_total 1"));

        let health = get(addr, "/health").await;
        assert!(health.ends_with("OK"));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        handle.await??;
        Ok(())
    }
}
