//! Controller configuration from `LBSYNC_*` environment variables

use anyhow::{bail, Context, Result};
use lbsync_core::ProjectorConfig;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Path of the northbound control utility
    pub nbctl_path: String,
    /// Timeout passed to every northbound command
    pub nbctl_timeout: Duration,
    /// Port group reject rules are attached to
    pub port_group: String,
    pub sctp_supported: bool,
    pub idle_events_enabled: bool,
    pub reject_rule_logging: bool,
    /// Period of the full reconcile pass; `None` disables it
    pub resync_interval: Option<Duration>,
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nbctl_path: "ovn-nbctl".to_string(),
            nbctl_timeout: Duration::from_secs(15),
            port_group: "clusterPortGroup".to_string(),
            sctp_supported: true,
            idle_events_enabled: false,
            reject_rule_logging: false,
            resync_interval: Some(Duration::from_secs(300)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9410)),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, starting from the defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("LBSYNC_NBCTL_PATH") {
            config.nbctl_path = path;
        }
        if let Some(secs) = lookup("LBSYNC_NBCTL_TIMEOUT_SECS") {
            let secs = parse_secs("LBSYNC_NBCTL_TIMEOUT_SECS", &secs)?;
            if secs == 0 {
                bail!("LBSYNC_NBCTL_TIMEOUT_SECS must be positive");
            }
            config.nbctl_timeout = Duration::from_secs(secs);
        }
        if let Some(group) = lookup("LBSYNC_PORT_GROUP") {
            config.port_group = group;
        }
        if let Some(flag) = lookup("LBSYNC_SCTP_SUPPORT") {
            config.sctp_supported = parse_flag("LBSYNC_SCTP_SUPPORT", &flag)?;
        }
        if let Some(flag) = lookup("LBSYNC_IDLE_EVENTS") {
            config.idle_events_enabled = parse_flag("LBSYNC_IDLE_EVENTS", &flag)?;
        }
        if let Some(flag) = lookup("LBSYNC_REJECT_LOGGING") {
            config.reject_rule_logging = parse_flag("LBSYNC_REJECT_LOGGING", &flag)?;
        }
        if let Some(secs) = lookup("LBSYNC_RESYNC_INTERVAL_SECS") {
            let secs = parse_secs("LBSYNC_RESYNC_INTERVAL_SECS", &secs)?;
            config.resync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(addr) = lookup("LBSYNC_METRICS_ADDR") {
            config.metrics_addr = addr
                .parse()
                .with_context(|| format!("LBSYNC_METRICS_ADDR: invalid address {:?}", addr))?;
        }

        Ok(config)
    }

    pub fn projector(&self) -> ProjectorConfig {
        ProjectorConfig {
            sctp_supported: self.sctp_supported,
            idle_events_enabled: self.idle_events_enabled,
            reject_rule_logging: self.reject_rule_logging,
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{}: expected seconds, got {:?}", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{}: expected a boolean, got {:?}", key, other),
    }
}
