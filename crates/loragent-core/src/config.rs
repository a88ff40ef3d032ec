//! Gateway configuration.
//!
//! Sources, in priority order:
//! 1. Environment variables (`LORAGENT_*`)
//! 2. A TOML file (`loragent.toml` or the path given explicitly)
//! 3. Built-in defaults
//!
//! ```toml
//! [storage]
//! backend = "redb"
//! path = "data/provisioning.redb"
//!
//! [context_broker]
//! url = "http://orion:1026"
//!
//! [transport.reconnect]
//! initial_delay_ms = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config_err;
use crate::error::Result;

/// Default values.
pub mod defaults {
    pub const CONFIG_FILE: &str = "loragent.toml";
    pub const STORE_PATH: &str = "data/provisioning.redb";
    pub const MQTT_PORT: u16 = 1883;
    pub const DATA_MODEL: &str = "cayennelpp";
    pub const CONTEXT_BROKER_URL: &str = "http://localhost:1026";
    pub const BROKER_TIMEOUT_SECS: u64 = 10;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const QUEUE_CAPACITY: usize = 256;
    pub const CLIENT_ID_PREFIX: &str = "loragent";
    pub const RECONNECT_INITIAL_MS: u64 = 1000;
    pub const RECONNECT_MULTIPLIER: f64 = 2.0;
    pub const RECONNECT_MAX_MS: u64 = 30_000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
    pub const RECONCILE_INTERVAL_SECS: u64 = 30;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "LORAGENT_CONFIG";
    pub const STORAGE_BACKEND: &str = "LORAGENT_STORAGE_BACKEND";
    pub const STORE_PATH: &str = "LORAGENT_STORE_PATH";
    pub const CB_URL: &str = "LORAGENT_CB_URL";
    pub const CB_TIMEOUT_SECS: &str = "LORAGENT_CB_TIMEOUT_SECS";
    pub const QUEUE_CAPACITY: &str = "LORAGENT_QUEUE_CAPACITY";
    pub const RECONCILE_INTERVAL_SECS: &str = "LORAGENT_RECONCILE_INTERVAL_SECS";
    pub const LOG_JSON: &str = "LORAGENT_LOG_JSON";
}

/// Persistence engine behind the provisioning store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Redb,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Redb,
            path: PathBuf::from(defaults::STORE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBrokerConfig {
    /// Base URL of the NGSIv2 context broker.
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for ContextBrokerConfig {
    fn default() -> Self {
        Self {
            url: defaults::CONTEXT_BROKER_URL.to_string(),
            timeout_secs: defaults::BROKER_TIMEOUT_SECS,
        }
    }
}

impl ContextBrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Transport reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Initial reconnect delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between reconnect attempts
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::RECONNECT_INITIAL_MS,
            backoff_multiplier: defaults::RECONNECT_MULTIPLIER,
            max_delay_ms: defaults::RECONNECT_MAX_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub keep_alive_secs: u64,
    /// Capacity of the per-connection inbound frame queue.
    pub queue_capacity: usize,
    pub client_id_prefix: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            client_id_prefix: defaults::CLIENT_ID_PREFIX.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound for in-flight work to finish during `stop()`.
    pub shutdown_timeout_ms: u64,
    /// Period of the background reconciliation pass; 0 disables it.
    pub reconcile_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            reconcile_interval_secs: defaults::RECONCILE_INTERVAL_SECS,
        }
    }
}

impl AgentConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub context_broker: ContextBrokerConfig,
    pub transport: TransportConfig,
    pub agent: AgentConfig,
}

impl GatewayConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from `path`, `$LORAGENT_CONFIG` or `loragent.toml`,
    /// then apply environment overrides and validate.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(env_vars::CONFIG).ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    config_err!("cannot read config file {}: {}", path.display(), e)
                })?;
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_toml_str(&content)?
            }
            None => match std::fs::read_to_string(defaults::CONFIG_FILE) {
                Ok(content) => {
                    info!(
                        category = "config",
                        "Loading config from: {}",
                        defaults::CONFIG_FILE
                    );
                    Self::from_toml_str(&content)?
                }
                Err(_) => {
                    info!(category = "config", "No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(env_vars::STORAGE_BACKEND) {
            self.storage.backend = match backend.to_lowercase().as_str() {
                "redb" => StorageBackendKind::Redb,
                "memory" => StorageBackendKind::Memory,
                other => {
                    return Err(config_err!(
                        "{} must be 'redb' or 'memory', got '{}'",
                        env_vars::STORAGE_BACKEND,
                        other
                    ))
                }
            };
        }
        if let Some(path) = lookup(env_vars::STORE_PATH) {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(url) = lookup(env_vars::CB_URL) {
            self.context_broker.url = url;
        }
        if let Some(secs) = lookup(env_vars::CB_TIMEOUT_SECS) {
            self.context_broker.timeout_secs = secs.parse().map_err(|_| {
                config_err!("{} must be an integer", env_vars::CB_TIMEOUT_SECS)
            })?;
        }
        if let Some(capacity) = lookup(env_vars::QUEUE_CAPACITY) {
            self.transport.queue_capacity = capacity.parse().map_err(|_| {
                config_err!("{} must be an integer", env_vars::QUEUE_CAPACITY)
            })?;
        }
        if let Some(secs) = lookup(env_vars::RECONCILE_INTERVAL_SECS) {
            self.agent.reconcile_interval_secs = secs.parse().map_err(|_| {
                config_err!("{} must be an integer", env_vars::RECONCILE_INTERVAL_SECS)
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = &self.context_broker.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(config_err!(
                "context_broker.url must be an http(s) URL, got '{}'",
                url
            ));
        }
        if self.context_broker.timeout_secs == 0 {
            return Err(config_err!("context_broker.timeout_secs must be positive"));
        }
        if self.transport.queue_capacity == 0 {
            return Err(config_err!("transport.queue_capacity must be positive"));
        }
        let reconnect = &self.transport.reconnect;
        if reconnect.backoff_multiplier < 1.0 {
            return Err(config_err!(
                "transport.reconnect.backoff_multiplier must be >= 1.0"
            ));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(config_err!(
                "transport.reconnect.initial_delay_ms exceeds max_delay_ms"
            ));
        }
        if self.storage.backend == StorageBackendKind::Redb
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(config_err!("storage.path must be set for the redb backend"));
        }
        Ok(())
    }
}
