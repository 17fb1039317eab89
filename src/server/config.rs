//! Daemon configuration.
//!
//! Loaded once at startup from JSON or TOML (chosen by file extension) and
//! never mutated afterwards.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};

/// Default bind host for every node.
pub const DEFAULT_SERVER: &str = "0.0.0.0";
/// Default UDP NAT idle timeout in seconds.
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 300;
/// Default log level (debug).
pub const DEFAULT_LOG_LEVEL: u8 = 5;
/// Default metrics queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host every node binds on
    #[serde(default = "default_server")]
    pub server: String,
    /// Listening nodes, one TCP and one UDP socket each
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// UDP NAT idle timeout (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
    /// 1 = error, 2 = warning, 3 = notice, 4 = info, 5 = debug
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// Connection metadata sink; metrics are disabled when absent
    #[serde(default)]
    pub influxdb: Option<InfluxConfig>,
    /// Local client roles
    #[serde(default)]
    pub local: Option<LocalConfig>,
}

/// One listening node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub port: u16,
    pub cipher: String,
    pub password: String,
    /// Concurrent TCP relay limit; unbounded when absent
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// InfluxDB 1.x connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://127.0.0.1:8086`
    pub addr: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    /// Retention duration in InfluxQL syntax
    #[serde(default = "default_retention")]
    pub retention: String,
    /// Bounded queue capacity; a batch is written at half of it
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Also flush a non-empty batch on this period (seconds)
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,
}

/// Local client section: SOCKS5 listener and fixed-target tunnels that
/// forward through a remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Remote node, `host:port`
    pub server: String,
    pub cipher: String,
    pub password: String,
    /// SOCKS5 listen address (TCP and UDP)
    #[serde(default)]
    pub socks: Option<String>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// A fixed-target TCP tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub listen: String,
    pub target: String,
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_udp_timeout() -> u64 {
    DEFAULT_UDP_TIMEOUT_SECS
}

fn default_log_level() -> u8 {
    DEFAULT_LOG_LEVEL
}

fn default_database() -> String {
    "ss_data".to_string()
}

fn default_retention_policy() -> String {
    "ss_data_rp".to_string()
}

fn default_retention() -> String {
    "1w".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;

        let is_toml = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml(&text)?
        } else {
            Self::from_json(&text)?
        };

        config.validate().map_err(Error::config)?;
        Ok(config)
    }

    /// Parse JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid JSON config: {}", e)))
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid TOML config: {}", e)))
    }

    /// Validate the configuration.
    ///
    /// An out-of-range `log_level` is not an error; see [`Config::log_filter`].
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.server.is_empty() {
            return Err("server cannot be empty".into());
        }
        if self.nodes.is_empty() && self.local.is_none() {
            return Err("at least one node or a local section must be configured".into());
        }

        let mut ports = std::collections::HashSet::new();
        for node in &self.nodes {
            // Port 0 binds an ephemeral port.
            if node.port != 0 && !ports.insert(node.port) {
                return Err(format!("duplicate node port {}", node.port));
            }
            if node.cipher.is_empty() {
                return Err(format!("node {}: cipher cannot be empty", node.port));
            }
            if node.max_connections == Some(0) {
                return Err(format!("node {}: max_connections must be positive", node.port));
            }
        }

        if let Some(influx) = &self.influxdb {
            if influx.addr.is_empty() {
                return Err("influxdb.addr cannot be empty".into());
            }
            if influx.database.is_empty() {
                return Err("influxdb.database cannot be empty".into());
            }
            if influx.queue_capacity < 2 {
                return Err("influxdb.queue_capacity must be at least 2".into());
            }
            if influx.flush_interval_secs == Some(0) {
                return Err("influxdb.flush_interval_secs must be positive".into());
            }
        }

        if let Some(local) = &self.local {
            if local.server.is_empty() {
                return Err("local.server cannot be empty".into());
            }
            if local.socks.is_none() && local.tunnels.is_empty() {
                return Err("local section needs socks or at least one tunnel".into());
            }
        }

        Ok(())
    }

    /// UDP NAT idle timeout.
    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    /// Log filter for the configured level, falling back to debug when the
    /// level is outside `1..=5`.
    pub fn log_filter(&self) -> LevelFilter {
        match self.log_level {
            1 => LevelFilter::ERROR,
            2 => LevelFilter::WARN,
            3 | 4 => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        }
    }
}

impl InfluxConfig {
    /// Optional periodic flush.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_secs.map(Duration::from_secs)
    }
}
