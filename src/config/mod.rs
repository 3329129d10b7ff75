//! Configuration management for meta-sentinel
//!
//! The configuration file is read once at startup. The core never sees it:
//! [`Config::sentinel_options`] and [`Config::pool_options`] turn it into the
//! plain option structs the Sentinel client and the pool are built from.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::connection::{ConnectOptions, Credentials};
use crate::core::Endpoint;
use crate::pool::PoolOptions;
use crate::sentinel::SentinelOptions;

/// Upper bound on configured Sentinel endpoints
pub const MAX_SENTINELS: usize = 16;

/// Main meta-sentinel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sentinel and failover settings
    pub replication: ReplicationConfig,
    /// Connections to the store nodes
    #[serde(default)]
    pub metastore: MetaStoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sentinel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Use Sentinel-driven failover
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name the Sentinels monitor the primary under
    pub master_name: String,
    /// Sentinel endpoints, queried in this order
    pub sentinels: Vec<Endpoint>,
    /// Topology polling interval in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Extra random delay per polling round in milliseconds
    #[serde(default)]
    pub monitor_jitter_ms: u64,
    /// Timeout for a single Sentinel query in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel_password: Option<String>,
}

/// Store node connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaStoreConfig {
    /// ACL user name (Redis 6+)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub tcp_keep_alive: bool,
    #[serde(default = "default_keep_alive_idle_sec")]
    pub tcp_keep_alive_idle_sec: u64,
    /// Serve reads from replicas when any is healthy
    #[serde(default = "default_true")]
    pub prefer_replica_reads: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_query_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_keep_alive_idle_sec() -> u64 {
    60
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            master_name: "mymaster".to_string(),
            sentinels: vec![Endpoint::new("127.0.0.1", 26379)],
            monitor_interval_ms: default_monitor_interval_ms(),
            monitor_jitter_ms: 0,
            query_timeout_ms: default_query_timeout_ms(),
            sentinel_password: None,
        }
    }
}

impl Default for MetaStoreConfig {
    fn default() -> Self {
        Self {
            auth_user: None,
            auth_password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            tcp_keep_alive: true,
            tcp_keep_alive_idle_sec: default_keep_alive_idle_sec(),
            prefer_replica_reads: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let replication = &self.replication;
        if replication.master_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "master_name cannot be empty".to_string(),
            ));
        }

        if replication.sentinels.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one sentinel must be configured".to_string(),
            ));
        }

        if replication.sentinels.len() > MAX_SENTINELS {
            return Err(ConfigError::ValidationError(format!(
                "too many sentinels: {} (maximum {})",
                replication.sentinels.len(),
                MAX_SENTINELS
            )));
        }

        for sentinel in &replication.sentinels {
            if sentinel.host.trim().is_empty() || sentinel.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid sentinel endpoint: {}",
                    sentinel
                )));
            }
        }

        if replication.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_interval_ms must be greater than 0".to_string(),
            ));
        }

        if replication.monitor_jitter_ms >= replication.monitor_interval_ms {
            return Err(ConfigError::ValidationError(
                "monitor_jitter_ms must be less than monitor_interval_ms".to_string(),
            ));
        }

        if replication.query_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "query_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let metastore = &self.metastore;
        if metastore.connect_timeout_ms == 0 || metastore.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "metastore timeouts must be greater than 0".to_string(),
            ));
        }

        if metastore.auth_user.is_some() && metastore.auth_password.is_none() {
            return Err(ConfigError::ValidationError(
                "auth_user requires auth_password".to_string(),
            ));
        }

        if metastore.tcp_keep_alive && metastore.tcp_keep_alive_idle_sec == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_keep_alive_idle_sec must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Options for the Sentinel client
    pub fn sentinel_options(&self) -> SentinelOptions {
        let replication = &self.replication;
        SentinelOptions {
            master_name: replication.master_name.clone(),
            sentinels: replication.sentinels.clone(),
            connect: ConnectOptions {
                connect_timeout: Duration::from_millis(self.metastore.connect_timeout_ms),
                command_timeout: Duration::from_millis(replication.query_timeout_ms),
                credentials: replication
                    .sentinel_password
                    .as_ref()
                    .map(|p| Credentials::password(p.as_str())),
                keep_alive: None,
            },
            monitor_interval: Duration::from_millis(replication.monitor_interval_ms),
            monitor_jitter: Duration::from_millis(replication.monitor_jitter_ms),
        }
    }

    /// Options for store node connections
    pub fn pool_options(&self) -> PoolOptions {
        let metastore = &self.metastore;
        PoolOptions {
            connect: ConnectOptions {
                connect_timeout: Duration::from_millis(metastore.connect_timeout_ms),
                command_timeout: Duration::from_millis(metastore.command_timeout_ms),
                credentials: metastore.auth_password.as_ref().map(|password| Credentials {
                    user: metastore.auth_user.clone(),
                    password: password.clone(),
                }),
                keep_alive: metastore
                    .tcp_keep_alive
                    .then(|| Duration::from_secs(metastore.tcp_keep_alive_idle_sec)),
            },
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            replication: ReplicationConfig {
                master_name: "mymaster".to_string(),
                sentinels: vec![
                    Endpoint::new("10.0.1.10", 26379),
                    Endpoint::new("10.0.1.11", 26379),
                    Endpoint::new("10.0.1.12", 26379),
                ],
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
