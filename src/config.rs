use std::net::SocketAddr;

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_health_check_timeout() -> u64 {
    60
}

/// One scheduled tag-update job definition: keep `image` on its latest
/// registry tag, creating the first container if none exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledUpdateConfig {
    pub image: String,
    pub cluster: Option<String>,
    pub node: Option<String>,
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Run against the in-memory simulated daemon/registry instead of
    /// external adapters.
    pub dev: bool,
    pub log_json: bool,
    /// Full container inventory reconciliation period.
    pub reconcile_interval_secs: u64,
    /// Forced node online/offline sweep period.
    pub node_sweep_interval_secs: u64,
    /// Default node registration ttl when a heartbeat names none.
    pub node_ttl_secs: u64,
    /// Debounce for event-driven per-node resyncs, and the ceiling after
    /// which a resync runs no matter how fast events keep arriving.
    pub resync_debounce_ms: u64,
    pub resync_debounce_ceiling_ms: u64,
    pub scheduled_update_interval_secs: u64,
    #[serde(default)]
    pub scheduled_updates: Vec<ScheduledUpdateConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8700".to_string(),
            dev: true,
            log_json: false,
            reconcile_interval_secs: 300,
            node_sweep_interval_secs: 60,
            node_ttl_secs: 60,
            resync_debounce_ms: 500,
            resync_debounce_ceiling_ms: 5000,
            scheduled_update_interval_secs: 300,
            scheduled_updates: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(figment::providers::Serialized::defaults(
            ServerConfig::default(),
        ))
        .merge(Yaml::string(&config_str))
        .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.reconcile_interval_secs == 0 || self.node_sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("reconcile and sweep intervals must be non-zero"));
        }
        if self.resync_debounce_ms > self.resync_debounce_ceiling_ms {
            return Err(anyhow::anyhow!(
                "resync debounce ({}ms) exceeds its ceiling ({}ms)",
                self.resync_debounce_ms,
                self.resync_debounce_ceiling_ms
            ));
        }
        for scheduled in &self.scheduled_updates {
            if scheduled.image.is_empty() {
                return Err(anyhow::anyhow!("scheduled update with empty image"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_listen_addr_rejected() {
        let config = ServerConfig {
            listen_addr: "nonsense".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debounce_must_not_exceed_ceiling() {
        let config = ServerConfig {
            resync_debounce_ms: 10_000,
            resync_debounce_ceiling_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
