//! WolfMeta Configuration
//!
//! This module provides configuration structures for the metanode
//! and the meta client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfMeta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMetaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Partition persistence configuration
    #[serde(default)]
    pub partition: PartitionSettings,

    /// Packet transport configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Meta client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for metadata packets
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Advertised address for clients and peers
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Root directory holding one `partition_{id}` directory per partition
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
}

/// Snapshot persistence settings applied to every partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSettings {
    /// Interval between leader-driven store ticks in seconds
    #[serde(default = "default_store_interval_secs")]
    pub store_interval_secs: u64,

    /// Depth of the pending store queue
    #[serde(default = "default_store_queue_depth")]
    pub store_queue_depth: usize,

    /// Delay before retrying a failed store in milliseconds
    #[serde(default = "default_store_retry_delay_ms")]
    pub store_retry_delay_ms: u64,
}

/// Packet transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read deadline in seconds
    #[serde(default = "default_deadline_secs")]
    pub read_deadline_secs: u64,

    /// Write deadline in seconds
    #[serde(default = "default_deadline_secs")]
    pub write_deadline_secs: u64,
}

/// Meta client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Volume name
    #[serde(default)]
    pub volume: String,

    /// Control-plane (master) addresses, host:port
    #[serde(default)]
    pub master_addrs: Vec<String>,

    /// Partition map refresh interval in seconds
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Timeout for control-plane HTTP calls in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:17210".to_string()
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmeta")
}

fn default_store_interval_secs() -> u64 {
    300
}

fn default_store_queue_depth() -> usize {
    5
}

fn default_store_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_deadline_secs() -> u64 {
    15
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:17220".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            store_interval_secs: default_store_interval_secs(),
            store_queue_depth: default_store_queue_depth(),
            store_retry_delay_ms: default_store_retry_delay_ms(),
        }
    }
}

impl PartitionSettings {
    /// Get the store tick interval as Duration
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
    }

    /// Get the store retry delay as Duration
    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_deadline_secs: default_deadline_secs(),
            write_deadline_secs: default_deadline_secs(),
        }
    }
}

impl NetworkConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the read deadline as Duration
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    /// Get the write deadline as Duration
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            volume: String::new(),
            master_addrs: Vec::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Get the refresh interval as Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Get the control-plane HTTP timeout as Duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMetaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfMetaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMetaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.listen.is_empty() {
            return Err(crate::Error::Config("node.listen cannot be empty".into()));
        }

        if self.partition.store_queue_depth == 0 {
            return Err(crate::Error::Config(
                "partition.store_queue_depth must be at least 1".into(),
            ));
        }

        if self.partition.store_interval_secs == 0 {
            return Err(crate::Error::Config(
                "partition.store_interval_secs must be greater than 0".into(),
            ));
        }

        if self.client.refresh_interval_secs == 0 {
            return Err(crate::Error::Config(
                "client.refresh_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or listen address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.listen)
    }

    /// Get the partition root directory
    pub fn meta_dir(&self) -> &PathBuf {
        &self.node.meta_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "meta-1"
listen = "0.0.0.0:17210"
meta_dir = "/var/lib/wolfmeta"

[partition]
store_interval_secs = 120

[client]
volume = "ltptest"
master_addrs = ["master-1:17010", "master-2:17010"]
"#;

        let config = WolfMetaConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "meta-1");
        assert_eq!(config.partition.store_interval(), Duration::from_secs(120));
        assert_eq!(config.partition.store_queue_depth, 5);
        assert_eq!(config.client.master_addrs.len(), 2);
        assert_eq!(config.client.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.network.read_deadline(), Duration::from_secs(15));
        assert_eq!(config.advertise_address(), "0.0.0.0:17210");
    }

    #[test]
    fn test_rejects_empty_queue() {
        let toml = r#"
[node]
id = "meta-1"

[partition]
store_queue_depth = 0
"#;

        assert!(WolfMetaConfig::from_str(toml).is_err());
    }
}
