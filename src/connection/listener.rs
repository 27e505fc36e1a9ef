//! Tunnel Listener
//!
//! Accepts local clients on a bound socket, admits them through the
//! connection policy and runs one [`TunnelSession`] per admitted client.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{EventSender, TunnelEvent};
use super::session::TunnelSession;
use crate::error::{ListenerError, SessionError};
use crate::metrics::{ConnectionSnapshot, NetworkStatistics};
use crate::relay::RelayClient;
use crate::security::ConnectionPolicy;
use crate::target::Target;
use crate::transport::SocketTransport;

/// Outcome of a finished accept loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerSummary {
    pub accepted: u64,
    pub rejected: u64,
}

/// Local listener for one tunnel
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    client: RelayClient,
    target: Target,
    policy: ConnectionPolicy,
    accept_limit: Option<u64>,
    events: EventSender,
}

impl Listener {
    /// Bind the local socket. Port 0 picks an ephemeral port.
    pub async fn bind(bind_addr: SocketAddr, client: RelayClient, target: Target) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ListenerError::Bind { addr: bind_addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr: bind_addr, source })?;

        info!(local_addr = %local_addr, target = %target, "Tunnel listener bound");

        Ok(Self {
            listener,
            local_addr,
            client,
            target,
            policy: ConnectionPolicy::default(),
            accept_limit: None,
            events: EventSender::new(),
        })
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Stop accepting after `limit` admitted clients
    pub fn with_accept_limit(mut self, limit: Option<u64>) -> Self {
        self.accept_limit = limit;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        self.client.statistics()
    }

    /// Run the accept loop until cancelled, the accept limit is reached, or
    /// accepting fails. Closes the listening socket and waits for in-flight
    /// sessions before returning.
    pub async fn listen(self, cancel: CancellationToken) -> Result<ListenerSummary, ListenerError> {
        let Listener {
            listener,
            local_addr,
            client,
            target,
            policy,
            accept_limit,
            events,
        } = self;
        let statistics = client.statistics().clone();

        let mut sessions = JoinSet::new();
        let mut summary = ListenerSummary::default();

        info!(local_addr = %local_addr, "Accepting tunnel clients");

        let outcome = loop {
            if let Some(limit) = accept_limit {
                if summary.accepted >= limit {
                    info!(limit, "Accept limit reached, no longer accepting clients");
                    break Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Listener cancelled");
                    break Ok(());
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Tunnel session task panicked");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        if !policy.is_client_allowed(remote_addr) {
                            warn!(client_addr = %remote_addr, "Client rejected by connection policy");
                            summary.rejected += 1;
                            statistics.record_rejected();
                            events.publish(TunnelEvent::ClientRejected { remote_addr });
                            drop(stream);
                            continue;
                        }

                        summary.accepted += 1;
                        let connection_id = summary.accepted;
                        statistics.record_accepted();
                        events.publish(TunnelEvent::ClientAccepted { connection_id, remote_addr });
                        debug!(connection_id, client_addr = %remote_addr, "Accepted tunnel client");

                        let session = TunnelSession::new(
                            connection_id,
                            SocketTransport::new(stream, remote_addr),
                            client.clone(),
                            target.clone(),
                        );
                        let events = events.clone();
                        let statistics = statistics.clone();
                        let session_cancel = cancel.child_token();
                        sessions.spawn(async move {
                            let result = session.run(session_cancel).await;
                            report_session(connection_id, remote_addr, result, &events, &statistics);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept tunnel client");
                        break Err(ListenerError::Accept(e));
                    }
                }
            }
        };

        drop(listener);
        debug!(in_flight = sessions.len(), "Listener closed, waiting for sessions");

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Tunnel session task panicked");
            }
        }

        info!(
            local_addr = %local_addr,
            accepted = summary.accepted,
            rejected = summary.rejected,
            "Tunnel listener stopped"
        );
        events.publish(TunnelEvent::ListenerStopped {
            accepted: summary.accepted,
            rejected: summary.rejected,
        });

        outcome.map(|()| summary)
    }
}

fn report_session(
    connection_id: u64,
    remote_addr: SocketAddr,
    result: Result<ConnectionSnapshot, SessionError>,
    events: &EventSender,
    statistics: &NetworkStatistics,
) {
    match result {
        Ok(snapshot) => events.publish(TunnelEvent::SessionClosed {
            connection_id,
            remote_addr,
            bytes_sent: snapshot.bytes_sent,
            bytes_received: snapshot.bytes_received,
        }),
        Err(e) => {
            warn!(connection_id, client_addr = %remote_addr, error = %e, "Tunnel session failed");
            statistics.record_failed();
            events.publish(TunnelEvent::SessionFailed {
                connection_id,
                remote_addr,
                error: e.to_string(),
            });
        }
    }
}
