//! Configuration management for arbor
//!
//! A node is configured from a TOML file (written by `arbor genconf`), with
//! `ARBOR_<SECTION>_<KEY>` environment variables layered on top. Every
//! protocol timer is a field here so tests can shrink them.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::crypto::{
    BoxKeyPair, BoxPublicKey, BoxSecretKey, NodeKeys, SigKeyPair, SigSecretKey,
};

mod error;

pub use error::ConfigError;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity, listeners and static peers
    pub node: NodeConfig,

    /// Link handshake and keep-alive timers
    pub link: LinkConfig,

    /// Spanning tree timers
    pub switch: SwitchConfig,

    /// DHT sizing and maintenance
    pub dht: DhtConfig,

    /// Sessions and searches
    pub session: SessionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex X25519 secret. Empty means "generate at startup".
    pub box_private_key: String,

    /// Hex Ed25519 seed. Empty means "generate at startup".
    pub signing_private_key: String,

    /// Listen URIs, e.g. `tcp://0.0.0.0:9001`
    pub listen: Vec<String>,

    /// Peers dialed at startup, e.g. `tcp://198.51.100.7:9001`
    pub peers: Vec<String>,

    /// If non-empty, only links from these box keys are accepted
    pub allowed_box_keys: Vec<String>,

    /// Largest datagram a session will accept from the application
    pub mtu: u16,

    /// How long shutdown waits for components to stop
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Deadline for the metadata exchange
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Send an empty frame after this much write silence
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Close the link after this much read silence
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Outbound traffic frames buffered per link before dropping
    pub send_queue: usize,

    /// Wait between attempts to reach a configured peer
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// A root not refreshed within this window is abandoned
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// How often a root refreshes its timestamp
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,

    /// Minimum spacing between accepted same-parent refreshes
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,

    /// Forget a peer that has not announced for this long
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

/// DHT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Candidates returned per lookup
    pub lookup_size: usize,

    /// Entries kept in the table
    pub max_entries: usize,

    /// Unanswered pings before an entry is dropped
    pub max_pings: u32,

    /// Entries silent this long are dropped
    #[serde(with = "humantime_serde")]
    pub silence_timeout: Duration,

    /// Upper bound of the per-entry ping back-off
    #[serde(with = "humantime_serde")]
    pub max_ping_throttle: Duration,

    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle sessions are closed after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Ping the remote side after this much receive silence
    #[serde(with = "humantime_serde")]
    pub ping_after: Duration,

    /// Fall back to a search when a ping stays unanswered this long
    #[serde(with = "humantime_serde")]
    pub search_after: Duration,

    /// Minimum spacing between pings
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Give up on a search after this long
    #[serde(with = "humantime_serde")]
    pub search_timeout: Duration,

    /// Retry a search step after this long without a response
    #[serde(with = "humantime_serde")]
    pub search_retry: Duration,

    /// How long a dial waits for the first pong once the search succeeded
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Candidates kept per search
    pub search_width: usize,

    /// Crypto worker count, 0 means one per CPU
    pub workers: usize,

    /// Datagrams queued while a session is being established
    pub pending_queue: usize,

    /// Decrypted datagrams buffered for a reader
    pub inbound_queue: usize,

    /// Inbound sessions waiting for accept()
    pub accept_backlog: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at startup
    pub enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            box_private_key: String::new(),
            signing_private_key: String::new(),
            listen: vec![],
            peers: vec![],
            allowed_box_keys: vec![],
            mtu: 65535,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(120),
            send_queue: 256,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            update_interval: Duration::from_secs(30),
            throttle: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            lookup_size: 16,
            max_entries: 64,
            max_pings: 3,
            silence_timeout: Duration::from_secs(60),
            max_ping_throttle: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            ping_after: Duration::from_secs(6),
            search_after: Duration::from_secs(6),
            ping_interval: Duration::from_secs(1),
            search_timeout: Duration::from_secs(10),
            search_retry: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(6),
            search_width: 16,
            workers: 0,
            pending_queue: 32,
            inbound_queue: 256,
            accept_backlog: 32,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(name) {
        *target = raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e)))?;
    }
    Ok(())
}

fn parse_env_duration(name: &str, target: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(name) {
        *target = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e)))?;
    }
    Ok(())
}

fn parse_env_list(name: &str, target: &mut Vec<String>) {
    if let Ok(raw) = env::var(name) {
        *target = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

impl Config {
    /// A fresh configuration with newly generated keys.
    pub fn generate() -> Self {
        let box_keys = BoxKeyPair::generate();
        let sig_keys = SigKeyPair::generate();
        let mut config = Self::default();
        config.node.box_private_key = box_keys.secret.to_hex();
        config.node.signing_private_key = sig_keys.secret.to_hex();
        config
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: ARBOR_<SECTION>_<KEY>
    /// Example: ARBOR_NODE_PEERS=tcp://10.0.0.1:9001,tcp://10.0.0.2:9001
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `ARBOR_*` variables on top of this configuration.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(key) = env::var("ARBOR_NODE_BOX_PRIVATE_KEY") {
            self.node.box_private_key = key;
        }
        if let Ok(key) = env::var("ARBOR_NODE_SIGNING_PRIVATE_KEY") {
            self.node.signing_private_key = key;
        }
        parse_env_list("ARBOR_NODE_LISTEN", &mut self.node.listen);
        parse_env_list("ARBOR_NODE_PEERS", &mut self.node.peers);
        parse_env_list("ARBOR_NODE_ALLOWED_BOX_KEYS", &mut self.node.allowed_box_keys);
        parse_env("ARBOR_NODE_MTU", &mut self.node.mtu)?;

        parse_env_duration("ARBOR_LINK_KEEPALIVE_INTERVAL", &mut self.link.keepalive_interval)?;
        parse_env_duration("ARBOR_LINK_IDLE_TIMEOUT", &mut self.link.idle_timeout)?;
        parse_env_duration("ARBOR_LINK_RECONNECT_INTERVAL", &mut self.link.reconnect_interval)?;

        parse_env_duration("ARBOR_SWITCH_TIMEOUT", &mut self.switch.timeout)?;
        parse_env_duration("ARBOR_SWITCH_UPDATE_INTERVAL", &mut self.switch.update_interval)?;

        parse_env("ARBOR_DHT_LOOKUP_SIZE", &mut self.dht.lookup_size)?;
        parse_env("ARBOR_DHT_MAX_ENTRIES", &mut self.dht.max_entries)?;

        parse_env_duration("ARBOR_SESSION_TIMEOUT", &mut self.session.timeout)?;
        parse_env_duration("ARBOR_SESSION_SEARCH_TIMEOUT", &mut self.session.search_timeout)?;
        parse_env("ARBOR_SESSION_WORKERS", &mut self.session.workers)?;

        if let Ok(level) = env::var("ARBOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        parse_env("ARBOR_LOG_JSON", &mut self.logging.json_format)?;
        parse_env("ARBOR_METRICS_ENABLED", &mut self.metrics.enabled)?;
        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.mtu < 1280 {
            return Err(ConfigError::ValidationFailed(format!(
                "mtu must be at least 1280, got {}",
                self.node.mtu
            )));
        }

        if !self.node.box_private_key.is_empty() {
            BoxSecretKey::from_hex(&self.node.box_private_key)
                .map_err(|e| ConfigError::InvalidValue(format!("box_private_key: {}", e)))?;
        }
        if !self.node.signing_private_key.is_empty() {
            SigSecretKey::from_hex(&self.node.signing_private_key)
                .map_err(|e| ConfigError::InvalidValue(format!("signing_private_key: {}", e)))?;
        }
        for key in &self.node.allowed_box_keys {
            BoxPublicKey::from_hex(key)
                .map_err(|e| ConfigError::InvalidValue(format!("allowed key {}: {}", key, e)))?;
        }

        if self.link.keepalive_interval >= self.link.idle_timeout {
            return Err(ConfigError::ValidationFailed(
                "keepalive_interval must be shorter than idle_timeout".to_string(),
            ));
        }

        if self.link.reconnect_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reconnect_interval must be greater than 0".to_string(),
            ));
        }

        if self.switch.update_interval >= self.switch.timeout {
            return Err(ConfigError::ValidationFailed(
                "switch update_interval must be shorter than timeout".to_string(),
            ));
        }

        if self.dht.lookup_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "lookup_size must be greater than 0".to_string(),
            ));
        }
        if self.dht.max_entries < 2 {
            return Err(ConfigError::ValidationFailed(
                "max_entries must be at least 2".to_string(),
            ));
        }

        if self.session.search_width == 0 || self.session.inbound_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "search_width and inbound_queue must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// The configured keys, or fresh ones where the config leaves them empty.
    pub fn node_keys(&self) -> Result<NodeKeys, ConfigError> {
        let box_keys = if self.node.box_private_key.is_empty() {
            BoxKeyPair::generate()
        } else {
            BoxSecretKey::from_hex(&self.node.box_private_key)
                .map(BoxKeyPair::from_secret)
                .map_err(|e| ConfigError::InvalidValue(format!("box_private_key: {}", e)))?
        };
        let sig_keys = if self.node.signing_private_key.is_empty() {
            SigKeyPair::generate()
        } else {
            SigSecretKey::from_hex(&self.node.signing_private_key)
                .map(SigKeyPair::from_secret)
                .map_err(|e| ConfigError::InvalidValue(format!("signing_private_key: {}", e)))?
        };
        Ok(NodeKeys { box_keys, sig_keys })
    }

    pub fn allowed_keys(&self) -> Result<Vec<BoxPublicKey>, ConfigError> {
        self.node
            .allowed_box_keys
            .iter()
            .map(|k| {
                BoxPublicKey::from_hex(k)
                    .map_err(|e| ConfigError::InvalidValue(format!("allowed key {}: {}", k, e)))
            })
            .collect()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }

    /// Worker count with the "one per CPU" default resolved.
    pub fn worker_count(&self) -> usize {
        if self.session.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.session.workers
        }
    }
}
