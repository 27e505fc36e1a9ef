//! Configuration Manager

use super::{Config, PolicyMode, TargetConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

/// Largest accepted growth factor between reconnect delays
const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from `IAPTUNNEL_*` environment variables on top
    /// of the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }
}

/// Values given on the command line. `None` leaves the configured value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub instance: Option<String>,
    pub port: Option<u16>,
    pub network_interface: Option<String>,
    pub bind: Option<SocketAddr>,
    pub local_port: Option<u16>,
    pub allow_all: bool,
    pub accept_limit: Option<u64>,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: Option<String>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_listener_config()
            .with_context(|| "Listener configuration validation failed")?;

        if let Some(target) = &self.target {
            validate_target(target)
                .with_context(|| "Target configuration validation failed")?;
        }

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        let relay = &self.relay;

        let endpoint = Url::parse(&relay.endpoint)
            .with_context(|| format!("relay.endpoint is not a valid URL: {}", relay.endpoint))?;
        if !["ws", "wss"].contains(&endpoint.scheme()) {
            bail!("relay.endpoint must use ws or wss");
        }

        if relay.connect_timeout.is_zero() {
            bail!("relay.connect_timeout must be greater than 0");
        }

        if relay.ack_threshold == 0 {
            bail!("relay.ack_threshold must be greater than 0");
        }

        let reconnect = &relay.reconnect;
        if reconnect.max_attempts == 0 {
            bail!("relay.reconnect.max_attempts must be at least 1");
        }
        if reconnect.initial_backoff.is_zero() {
            bail!("relay.reconnect.initial_backoff must be greater than 0");
        }
        if reconnect.max_backoff < reconnect.initial_backoff {
            bail!("relay.reconnect.max_backoff cannot be smaller than initial_backoff");
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&reconnect.multiplier) {
            bail!(
                "relay.reconnect.multiplier must be between 1.0 and {}",
                MAX_BACKOFF_MULTIPLIER
            );
        }

        let flow = &relay.flow_control;
        if flow.high_water_mark == 0 {
            bail!("relay.flow_control.high_water_mark must be greater than 0");
        }
        if flow.low_water_mark >= flow.high_water_mark {
            bail!("relay.flow_control.low_water_mark must be below high_water_mark");
        }

        Ok(())
    }

    fn validate_listener_config(&self) -> Result<()> {
        let policy = &self.listener.policy;
        if policy.mode == PolicyMode::AllowList && policy.allow.is_empty() {
            bail!("listener.policy.allow must list at least one network in allow_list mode");
        }
        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Override values from environment variables looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("IAPTUNNEL_RELAY_ENDPOINT") {
            self.relay.endpoint = endpoint;
        }

        if let Some(timeout) = lookup("IAPTUNNEL_CONNECT_TIMEOUT") {
            self.relay.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid IAPTUNNEL_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(attempts) = lookup("IAPTUNNEL_RECONNECT_ATTEMPTS") {
            self.relay.reconnect.max_attempts = attempts.parse::<u32>()
                .with_context(|| format!("Invalid IAPTUNNEL_RECONNECT_ATTEMPTS: {}", attempts))?;
        }

        if let Some(bind_addr) = lookup("IAPTUNNEL_BIND_ADDR") {
            self.listener.bind_addr = bind_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid IAPTUNNEL_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(limit) = lookup("IAPTUNNEL_ACCEPT_LIMIT") {
            self.listener.accept_limit = limit.parse::<u64>()
                .with_context(|| format!("Invalid IAPTUNNEL_ACCEPT_LIMIT: {}", limit))?;
        }

        if let Some(log_level) = lookup("IAPTUNNEL_LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }

        if let Some(metrics_addr) = lookup("IAPTUNNEL_METRICS_ADDR") {
            self.monitoring.metrics_addr = Some(metrics_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid IAPTUNNEL_METRICS_ADDR: {}", metrics_addr))?);
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) -> Result<()> {
        if let Some(bind) = cli.bind {
            self.listener.bind_addr = bind;
            tracing::info!("CLI override: bind address set to {}", bind);
        }

        if let Some(port) = cli.local_port {
            self.listener.bind_addr.set_port(port);
            tracing::info!("CLI override: local port set to {}", port);
        }

        if cli.allow_all {
            self.listener.policy.mode = PolicyMode::AllowAll;
            tracing::info!("CLI override: accepting clients from any address");
        }

        if let Some(limit) = cli.accept_limit {
            self.listener.accept_limit = limit;
            tracing::info!("CLI override: accept limit set to {}", limit);
        }

        if let Some(metrics_addr) = cli.metrics_addr {
            self.monitoring.metrics_addr = Some(metrics_addr);
            tracing::info!("CLI override: metrics endpoint set to {}", metrics_addr);
        }

        if let Some(log_level) = &cli.log_level {
            self.monitoring.log_level = log_level.clone();
        }

        let target_given = cli.project.is_some()
            || cli.zone.is_some()
            || cli.instance.is_some()
            || cli.port.is_some()
            || cli.network_interface.is_some();
        if target_given {
            self.target = Some(merge_target(self.target.take(), cli)?);
        }

        Ok(())
    }
}

fn merge_target(base: Option<TargetConfig>, cli: &CliOverrides) -> Result<TargetConfig> {
    let pick = |given: &Option<String>, configured: Option<&String>, name: &str| -> Result<String> {
        given
            .clone()
            .or_else(|| configured.cloned())
            .with_context(|| format!("--{} is required when no target is configured", name))
    };

    let target = TargetConfig {
        project: pick(&cli.project, base.as_ref().map(|t| &t.project), "project")?,
        zone: pick(&cli.zone, base.as_ref().map(|t| &t.zone), "zone")?,
        instance: pick(&cli.instance, base.as_ref().map(|t| &t.instance), "instance")?,
        port: cli
            .port
            .or(base.as_ref().map(|t| t.port))
            .with_context(|| "--port is required when no target is configured")?,
        network_interface: cli
            .network_interface
            .clone()
            .or_else(|| base.as_ref().map(|t| t.network_interface.clone()))
            .unwrap_or_else(|| crate::protocol::constants::DEFAULT_NETWORK_INTERFACE.to_string()),
    };

    tracing::info!(
        "CLI override: target set to {}/{}/{}:{}",
        target.project, target.zone, target.instance, target.port
    );
    Ok(target)
}

fn validate_target(target: &TargetConfig) -> Result<()> {
    if target.project.is_empty() {
        bail!("target.project must not be empty");
    }
    if target.zone.is_empty() {
        bail!("target.zone must not be empty");
    }
    if target.instance.is_empty() {
        bail!("target.instance must not be empty");
    }
    if target.port == 0 {
        bail!("target.port must not be 0");
    }
    if target.network_interface.is_empty() {
        bail!("target.network_interface must not be empty");
    }
    Ok(())
}
