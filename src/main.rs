//! iaptunnel - IAP TCP forwarding client
//!
//! Opens a local port and forwards every connection to it to a port on a VM
//! through the IAP relay.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iaptunnel::{
    auth::EnvCredential,
    config::{CliOverrides, ConfigManager},
    metrics::MetricsServer,
    RelayClient, ShutdownCoordinator, Tunnel, TunnelEvent, TunnelOptions,
};

/// CLI arguments for iaptunnel
#[derive(Parser, Debug)]
#[command(name = "iaptunnel")]
#[command(about = "Forward a local port to a VM through the IAP TCP-forwarding relay")]
#[command(version)]
#[command(long_about = "
Forward a local port to a VM through the IAP TCP-forwarding relay.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  IAPTUNNEL_ACCESS_TOKEN       - Bearer token for the relay (see --token-env)
  IAPTUNNEL_RELAY_ENDPOINT     - Relay endpoint (e.g., wss://tunnel.cloudproxy.app/v4)
  IAPTUNNEL_CONNECT_TIMEOUT    - Connect timeout (e.g., 30s)
  IAPTUNNEL_RECONNECT_ATTEMPTS - Reconnect attempts per drop
  IAPTUNNEL_BIND_ADDR          - Local bind address (e.g., 127.0.0.1:0)
  IAPTUNNEL_ACCEPT_LIMIT       - Stop after this many clients (0 = unlimited)
  IAPTUNNEL_METRICS_ADDR       - Prometheus endpoint address
  IAPTUNNEL_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "iaptunnel.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(long, help = "Project containing the VM")]
    pub project: Option<String>,

    #[arg(long, help = "Zone of the VM")]
    pub zone: Option<String>,

    #[arg(long, help = "VM instance name")]
    pub instance: Option<String>,

    #[arg(long, help = "Port on the VM to forward to")]
    pub port: Option<u16>,

    #[arg(long, help = "Network interface of the VM (default: nic0)")]
    pub network_interface: Option<String>,

    /// Local port to listen on (0 picks a free port)
    #[arg(short, long, help = "Local port to listen on")]
    pub local_port: Option<u16>,

    #[arg(short, long, help = "Local bind address (e.g., 127.0.0.1:3389)")]
    pub bind: Option<SocketAddr>,

    #[arg(long, help = "Accept clients from any address, not only loopback")]
    pub allow_all: bool,

    #[arg(long, help = "Stop after this many clients have connected")]
    pub accept_limit: Option<u64>,

    #[arg(
        long,
        default_value = "IAPTUNNEL_ACCESS_TOKEN",
        help = "Environment variable holding the relay bearer token"
    )]
    pub token_env: String,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            project: self.project.clone(),
            zone: self.zone.clone(),
            instance: self.instance.clone(),
            port: self.port,
            network_interface: self.network_interface.clone(),
            bind: self.bind,
            local_port: self.local_port,
            allow_all: self.allow_all,
            accept_limit: self.accept_limit,
            metrics_addr: self.metrics_addr,
            log_level: if self.verbose {
                Some("debug".to_string())
            } else {
                self.log_level.clone()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config
        .merge_with_cli_args(&args.overrides())
        .context("Invalid command-line arguments")?;

    init_tracing(&config.monitoring.log_level)?;

    info!("Starting iaptunnel v{}", env!("CARGO_PKG_VERSION"));

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    let target_config = config
        .target
        .clone()
        .context("No target configured; pass --project, --zone, --instance and --port")?;
    let target = target_config.to_target();

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Target: {}", target);
        info!("  Relay endpoint: {}", config.relay.endpoint);
        info!("  Bind address: {}", config.listener.bind_addr);
        info!("  Policy: {:?}", config.listener.policy.mode);
        info!("  Connect timeout: {:?}", config.relay.connect_timeout);
        info!("  Reconnect attempts: {}", config.relay.reconnect.max_attempts);
        return Ok(());
    }

    let credential = Arc::new(EnvCredential::new(&args.token_env));
    let client = RelayClient::from_config(&config.relay, credential)
        .context("Invalid relay configuration")?;

    let tunnel = Tunnel::start(client, target, TunnelOptions::from_config(&config.listener))
        .await
        .context("Failed to start tunnel")?;

    println!("Listening on port [{}].", tunnel.local_addr().port());
    info!(local_addr = %tunnel.local_addr(), target = %tunnel.target(), "Tunnel ready");

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(10));

    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(tunnel.statistics().clone(), addr)
                .await
                .with_context(|| format!("Failed to bind metrics endpoint {}", addr))?;
            info!("Serving metrics on http://{}/metrics", addr);
            Some(tokio::spawn(server.run(shutdown_coordinator.token())))
        }
        None => None,
    };

    let mut events = tunnel.subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} tunnel events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");

    // Run until signalled or until the listener stops on its own
    tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        result = tunnel.wait() => match result {
            Ok(Some(summary)) => info!(accepted = summary.accepted, "Tunnel finished"),
            Ok(None) => {}
            Err(e) => error!("Tunnel listener failed: {}", e),
        },
    }

    shutdown_coordinator.trigger();
    if let Err(e) = shutdown_coordinator.shutdown_tunnel(&tunnel).await {
        error!("Error during shutdown: {}", e);
    }

    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Err(e)) => error!("Metrics server error: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    let statistics = tunnel.statistics().snapshot();
    drop(tunnel);
    events_handle.abort();

    info!(
        bytes_sent = statistics.bytes_sent,
        bytes_received = statistics.bytes_received,
        connections = statistics.connections_accepted,
        reconnects = statistics.reconnects,
        "Shutdown complete"
    );

    Ok(())
}

fn log_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::ClientAccepted { connection_id, remote_addr } => {
            info!(connection_id, client_addr = %remote_addr, "Client connected");
        }
        TunnelEvent::ClientRejected { remote_addr } => {
            warn!(client_addr = %remote_addr, "Client rejected by policy");
        }
        TunnelEvent::SessionClosed {
            connection_id,
            bytes_sent,
            bytes_received,
            ..
        } => {
            info!(connection_id, bytes_sent, bytes_received, "Client disconnected");
        }
        TunnelEvent::SessionFailed { connection_id, error, .. } => {
            error!(connection_id, "Connection failed: {}", error);
        }
        TunnelEvent::ListenerStopped { accepted, rejected } => {
            info!(accepted, rejected, "Listener stopped");
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
