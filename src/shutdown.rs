//! Graceful Shutdown Handling
//!
//! Turns SIGTERM and SIGINT into a cancellation of the process-wide token and
//! closes running tunnels within a bounded time.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tunnel::Tunnel;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Cancelled once shutdown starts
    token: CancellationToken,
    /// Bound on closing a tunnel
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Token that is cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start shutdown without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT (Ctrl+C), then start shutdown.
    /// Returns early if shutdown was triggered some other way.
    pub async fn listen_for_signals(&self) -> Result<()> {
        debug!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    debug!("Shutdown already triggered");
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.token.cancelled() => {
                    debug!("Shutdown already triggered");
                }
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Close a tunnel, giving its sessions up to the shutdown timeout to
    /// finish
    pub async fn shutdown_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        info!(local_addr = %tunnel.local_addr(), "Closing tunnel (timeout: {:?})", self.timeout);
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, tunnel.close()).await {
            Ok(Ok(Some(summary))) => {
                info!(
                    accepted = summary.accepted,
                    rejected = summary.rejected,
                    "Tunnel closed gracefully in {:?}",
                    start_time.elapsed()
                );
            }
            Ok(Ok(None)) => debug!("Tunnel was already closed"),
            Ok(Err(e)) => warn!("Tunnel listener ended with an error: {}", e),
            Err(_) => {
                warn!("Shutdown timeout reached after {:?} with sessions still active", start_time.elapsed());
                return Err(anyhow::anyhow!("tunnel did not close within {:?}", self.timeout));
            }
        }

        Ok(())
    }
}
