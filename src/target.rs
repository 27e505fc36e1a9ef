//! Relay Targets
//!
//! A [`Target`] names the VM, port and network interface a tunnel forwards
//! to. A [`RelayEndpoint`] turns targets into relay connect and reconnect URLs.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::RelayError;
use crate::protocol::constants::*;

/// Fully qualified VM instance reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(project: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/zones/{}/instances/{}", self.project, self.zone, self.name)
    }
}

/// A VM port to relay to. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    instance: InstanceLocator,
    port: u16,
    network_interface: String,
}

impl Target {
    /// Create a target on the default network interface
    pub fn new(instance: InstanceLocator, port: u16) -> Self {
        Self::with_interface(instance, port, DEFAULT_NETWORK_INTERFACE)
    }

    pub fn with_interface(
        instance: InstanceLocator,
        port: u16,
        network_interface: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            port,
            network_interface: network_interface.into(),
        }
    }

    pub fn instance(&self) -> &InstanceLocator {
        &self.instance
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn network_interface(&self) -> &str {
        &self.network_interface
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.instance, self.port, self.network_interface)
    }
}

/// The relay service a client talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    base_url: Url,
    origin: String,
    user_agent: String,
}

impl RelayEndpoint {
    /// Create an endpoint rooted at `base_url` (e.g. `wss://tunnel.cloudproxy.app/v4`)
    pub fn new(base_url: &str, user_agent: impl Into<String>) -> Result<Self, RelayError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RelayError::InvalidArgument(format!("invalid relay endpoint {}: {}", base_url, e)))?;

        match base_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RelayError::InvalidArgument(format!(
                    "relay endpoint must use ws or wss, not {}",
                    other
                )))
            }
        }

        Ok(Self {
            base_url,
            origin: RELAY_ORIGIN.to_string(),
            user_agent: user_agent.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// URL for opening a new relay session to `target`
    pub fn connect_url(&self, target: &Target) -> Url {
        let mut url = self.endpoint_url(CONNECT_PATH);
        url.query_pairs_mut()
            .append_pair("project", &target.instance.project)
            .append_pair("port", &target.port.to_string())
            .append_pair("newWebsocket", "true")
            .append_pair("zone", &target.instance.zone)
            .append_pair("instance", &target.instance.name)
            .append_pair("interface", &target.network_interface);
        url
    }

    /// URL for resuming session `sid` after `ack` bytes were received
    pub fn reconnect_url(&self, target: &Target, sid: &str, ack: u64) -> Url {
        let mut url = self.endpoint_url(RECONNECT_PATH);
        url.query_pairs_mut()
            .append_pair("sid", sid)
            .append_pair("ack", &ack.to_string())
            .append_pair("newWebsocket", "true")
            .append_pair("zone", &target.instance.zone);
        url
    }

    fn endpoint_url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", base_path, path));
        url.set_query(None);
        url
    }
}

impl Default for RelayEndpoint {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_RELAY_ENDPOINT).expect("default relay endpoint is a valid URL"),
            origin: RELAY_ORIGIN.to_string(),
            user_agent: concat!("iaptunnel/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
