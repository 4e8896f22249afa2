//! Configuration loading and validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Main configuration for the dnsgate gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Addresses the DNS listener binds to.
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,

    /// Also answer DNS over TCP on the listen addresses.
    #[serde(default)]
    pub tcp: bool,

    /// Read timeout applied to each upstream resolver, in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Upstream used when no resolver was captured from the host.
    #[serde(default = "default_fallback_upstream")]
    pub fallback_upstream: SocketAddr,

    /// Local network suffixes stripped from query names before matching.
    /// Checked in order, the first match wins.
    #[serde(default = "default_local_suffixes")]
    pub local_suffixes: Vec<String>,

    /// Directory holding the persisted state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tcp: false,
            upstream_timeout_ms: default_upstream_timeout_ms(),
            fallback_upstream: default_fallback_upstream(),
            local_suffixes: default_local_suffixes(),
            state_dir: default_state_dir(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_listen() -> Vec<SocketAddr> {
    vec![
        SocketAddr::from(([127, 0, 0, 1], 53)),
        SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 53)),
    ]
}

const fn default_upstream_timeout_ms() -> u64 {
    3000
}

fn default_fallback_upstream() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

fn default_local_suffixes() -> Vec<String> {
    vec![
        "homenet.telecomitalia.it".to_string(),
        "home".to_string(),
        "lan".to_string(),
    ]
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9153))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(ConfigError::Validation("listen must not be empty".into()).into());
        }

        if self.upstream_timeout_ms == 0 {
            return Err(ConfigError::Validation("upstream_timeout_ms must be > 0".into()).into());
        }

        for suffix in &self.local_suffixes {
            let trimmed = suffix.trim().trim_matches('.');
            if trimmed.is_empty() {
                return Err(ConfigError::Validation("empty local suffix".into()).into());
            }
        }

        Ok(())
    }

    /// Local suffixes in matcher form: lowercase, without surrounding dots.
    pub fn normalized_suffixes(&self) -> Vec<String> {
        self.local_suffixes
            .iter()
            .map(|s| s.trim().trim_matches('.').to_lowercase())
            .collect()
    }

    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn domains_path(&self) -> PathBuf {
        self.state_dir.join("domains.json")
    }

    pub fn runtime_state_path(&self) -> PathBuf {
        self.state_dir.join("runtime_state.json")
    }

    pub fn schedule_state_path(&self) -> PathBuf {
        self.state_dir.join("schedule_state.json")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("dns_state.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.state_dir.join("credentials.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }
}
