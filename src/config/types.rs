//! Configuration Types

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::constants::{DEFAULT_NETWORK_INTERFACE, DEFAULT_RELAY_ENDPOINT};
use crate::target::{InstanceLocator, Target};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub listener: ListenerConfig,
    pub target: Option<TargetConfig>,
    pub monitoring: MonitoringConfig,
}

/// Relay connection settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub endpoint: String,
    pub user_agent: String,
    /// Bound on connecting and on each reconnect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Received bytes between two ACKs
    pub ack_threshold: u64,
    pub reconnect: ReconnectConfig,
    pub flow_control: FlowControlConfig,
}

/// Reconnect bounds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

/// Send window, in unacknowledged bytes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub high_water_mark: u64,
    pub low_water_mark: u64,
}

/// Local listener settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// 0 means unlimited
    pub accept_limit: u64,
    pub policy: PolicyConfig,
}

/// Connection policy settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub allow: Vec<IpNet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    Loopback,
    AllowAll,
    AllowList,
}

/// Target VM settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetConfig {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub port: u16,
    #[serde(default = "default_network_interface")]
    pub network_interface: String,
}

impl TargetConfig {
    pub fn to_target(&self) -> Target {
        Target::with_interface(
            InstanceLocator::new(&self.project, &self.zone, &self.instance),
            self.port,
            &self.network_interface,
        )
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
}

fn default_network_interface() -> String {
    DEFAULT_NETWORK_INTERFACE.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RELAY_ENDPOINT.to_string(),
            user_agent: format!("iaptunnel/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(30),
            ack_threshold: 32 * 1024,
            reconnect: ReconnectConfig::default(),
            flow_control: FlowControlConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 2 * 1024 * 1024,
            low_water_mark: 1024 * 1024,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            accept_limit: 0,
            policy: PolicyConfig::default(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}
