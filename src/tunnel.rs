//! Tunnel
//!
//! A running local endpoint forwarding to one target. Owns the listener task
//! and the cancellation token every session of the tunnel derives from.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ListenerConfig;
use crate::connection::{EventSender, Listener, ListenerSummary, TunnelEvent};
use crate::error::ListenerError;
use crate::metrics::NetworkStatistics;
use crate::relay::RelayClient;
use crate::security::ConnectionPolicy;
use crate::target::Target;

/// Flags a tunnel was created with. Recorded with the tunnel and reported
/// back through [`Tunnel::flags`]; no flag currently changes forwarding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TunnelFlags {
    #[default]
    None,
}

/// How a tunnel accepts local clients
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub bind_addr: SocketAddr,
    pub policy: ConnectionPolicy,
    /// Stop accepting after this many admitted clients
    pub accept_limit: Option<u64>,
    pub flags: TunnelFlags,
}

impl TunnelOptions {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            bind_addr: config.bind_addr,
            policy: ConnectionPolicy::from_config(&config.policy),
            accept_limit: (config.accept_limit > 0).then_some(config.accept_limit),
            flags: TunnelFlags::None,
        }
    }
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            policy: ConnectionPolicy::default(),
            accept_limit: None,
            flags: TunnelFlags::None,
        }
    }
}

type ListenerTask = JoinHandle<Result<ListenerSummary, ListenerError>>;

/// Handle to a running tunnel. Dropping it cancels the tunnel.
pub struct Tunnel {
    id: Uuid,
    target: Target,
    flags: TunnelFlags,
    local_addr: SocketAddr,
    statistics: Arc<NetworkStatistics>,
    events: EventSender,
    cancel: CancellationToken,
    task: Mutex<Option<ListenerTask>>,
}

impl Tunnel {
    /// Bind the local endpoint and start accepting clients
    pub async fn start(client: RelayClient, target: Target, options: TunnelOptions) -> Result<Self, ListenerError> {
        let statistics = Arc::new(NetworkStatistics::new());
        let client = client.with_statistics(statistics.clone());
        let events = EventSender::new();

        let listener = Listener::bind(options.bind_addr, client, target.clone())
            .await?
            .with_policy(options.policy)
            .with_accept_limit(options.accept_limit)
            .with_events(events.clone());
        let local_addr = listener.local_addr();

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.listen(cancel.clone()));

        info!(
            tunnel_id = %id,
            local_addr = %local_addr,
            target = %target,
            flags = ?options.flags,
            "Tunnel started"
        );

        Ok(Self {
            id,
            target,
            flags: options.flags,
            local_addr,
            statistics,
            events,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn flags(&self) -> TunnelFlags {
        self.flags
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    /// Receive tunnel events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Stop accepting, cancel every session and wait for them to finish.
    ///
    /// Only the first call observes the listener's outcome; later calls
    /// return `Ok(None)`.
    pub async fn close(&self) -> Result<Option<ListenerSummary>, ListenerError> {
        debug!(tunnel_id = %self.id, local_addr = %self.local_addr, "Closing tunnel");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the tunnel to stop on its own (accept limit or listener
    /// failure) without cancelling it.
    pub async fn wait(&self) -> Result<Option<ListenerSummary>, ListenerError> {
        self.join().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn join(&self) -> Result<Option<ListenerSummary>, ListenerError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(None);
        };

        let outcome = handle.await;
        *task = None;

        match outcome {
            Ok(result) => result.map(Some),
            Err(e) => {
                error!(error = %e, "Tunnel listener task failed");
                Ok(None)
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("flags", &self.flags)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
