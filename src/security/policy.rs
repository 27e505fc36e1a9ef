//! Connection Policy
//!
//! Decides which local clients may use a tunnel. Evaluated once per accepted
//! socket, before any relay connection is opened.

use ipnet::IpNet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{PolicyConfig, PolicyMode};

/// Which local clients are allowed to use a tunnel
#[derive(Clone, Default)]
pub enum ConnectionPolicy {
    /// Accept every client
    AllowAll,
    /// Accept clients connecting from a loopback address
    #[default]
    LoopbackOnly,
    /// Accept clients whose address falls within one of the networks
    AllowList(Vec<IpNet>),
    /// Accept clients for which the predicate returns true
    Custom(Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>),
}

impl ConnectionPolicy {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        ConnectionPolicy::Custom(Arc::new(predicate))
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        match config.mode {
            PolicyMode::AllowAll => ConnectionPolicy::AllowAll,
            PolicyMode::Loopback => ConnectionPolicy::LoopbackOnly,
            PolicyMode::AllowList => ConnectionPolicy::AllowList(config.allow.clone()),
        }
    }

    pub fn is_client_allowed(&self, remote: SocketAddr) -> bool {
        // IPv4 clients of a dual-stack socket show up as mapped addresses
        let ip = match remote.ip() {
            std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped().map(Into::into).unwrap_or(remote.ip()),
            ip => ip,
        };

        match self {
            ConnectionPolicy::AllowAll => true,
            ConnectionPolicy::LoopbackOnly => ip.is_loopback(),
            ConnectionPolicy::AllowList(networks) => networks.iter().any(|net| net.contains(&ip)),
            ConnectionPolicy::Custom(predicate) => predicate(remote),
        }
    }
}

impl fmt::Debug for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPolicy::AllowAll => f.write_str("AllowAll"),
            ConnectionPolicy::LoopbackOnly => f.write_str("LoopbackOnly"),
            ConnectionPolicy::AllowList(networks) => f.debug_tuple("AllowList").field(networks).finish(),
            ConnectionPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
