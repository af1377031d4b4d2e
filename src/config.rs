//! Node configuration
//!
//! Everything a node needs is one [`NodeConfig`], loadable from TOML.
//! Durations are written in milliseconds.
//!
//! ```toml
//! display_name = "alice"
//! database_url = "sqlite://peers.db?mode=rwc"
//!
//! [router]
//! max_hops = 7
//!
//! [mesh]
//! bind_addr = "0.0.0.0:7946"
//! seeds = ["192.168.1.20:7946"]
//! ```

use crate::dedup::DedupConfig;
use crate::delivery::DeliveryConfig;
use crate::metrics::MetricsConfig;
use crate::router::RouterConfig;
use crate::transport::{QuicRelayConfig, UdpMeshConfig, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Room left in a frame for the routing header
const FRAME_HEADER_ALLOWANCE: usize = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex secret key file; a fresh identity is generated when unset
    pub identity_path: Option<PathBuf>,

    /// SQLite URL for peer persistence; volatile registry when unset
    pub database_url: Option<String>,

    /// Name announced to other peers
    pub display_name: Option<String>,

    pub router: RouterConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,

    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,

    /// Peers not heard from for this long are marked stale
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,

    /// Presence beacon period (0 = never announce)
    #[serde(with = "duration_ms")]
    pub announce_interval: Duration,

    pub max_payload_bytes: usize,

    pub mesh: Option<UdpMeshConfig>,
    pub relay: Option<QuicRelayConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity_path: None,
            database_url: None,
            display_name: None,
            router: RouterConfig::default(),
            dedup: DedupConfig::default(),
            delivery: DeliveryConfig::default(),
            maintenance_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            announce_interval: Duration::from_secs(60),
            max_payload_bytes: 32 * 1024,
            mesh: None,
            relay: None,
            metrics: None,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.router.max_hops == 0 {
            return Err(ConfigError::Invalid("router.max_hops must be at least 1".into()));
        }
        if self.dedup.capacity == 0 {
            return Err(ConfigError::Invalid("dedup.capacity must be positive".into()));
        }
        if self.dedup.default_ttl.is_zero() {
            return Err(ConfigError::Invalid("dedup.default_ttl must be positive".into()));
        }
        if self.delivery.ack_timeout.is_zero() || self.delivery.backoff_base.is_zero() {
            return Err(ConfigError::Invalid(
                "delivery.ack_timeout and delivery.backoff_base must be positive".into(),
            ));
        }
        let first_retry = self.delivery.ack_timeout + self.delivery.backoff_base;
        if self.router.retransmit_after >= first_retry {
            return Err(ConfigError::Invalid(format!(
                "router.retransmit_after must be shorter than the first retry ({:?})",
                first_retry
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Invalid("maintenance_interval must be positive".into()));
        }
        let payload_limit = MAX_FRAME_SIZE - FRAME_HEADER_ALLOWANCE;
        if self.max_payload_bytes > payload_limit {
            return Err(ConfigError::Invalid(format!(
                "max_payload_bytes {} exceeds frame limit {}",
                self.max_payload_bytes, payload_limit
            )));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.router.max_hops, 7);
        assert_eq!(config.dedup.capacity, 10_000);
        assert_eq!(config.delivery.retry_budget, 3);
        assert!(config.mesh.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = NodeConfig::from_toml_str(
            r#"
            display_name = "alice"
            announce_interval = 0

            [router]
            max_hops = 3
            send_timeout = 500

            [delivery]
            ack_timeout = 1000
            retry_budget = 5

            [mesh]
            bind_addr = "127.0.0.1:7946"
            seeds = ["127.0.0.1:7947"]

            [relay]
            relays = ["10.0.0.1:4433"]
            insecure_skip_verify = true
            "#,
        )
        .unwrap();

        assert_eq!(config.display_name.as_deref(), Some("alice"));
        assert!(config.announce_interval.is_zero());
        assert_eq!(config.router.max_hops, 3);
        assert_eq!(config.router.send_timeout, Duration::from_millis(500));
        assert_eq!(config.delivery.ack_timeout, Duration::from_secs(1));
        assert_eq!(config.delivery.retry_budget, 5);
        // Unset fields inside a section keep their defaults
        assert_eq!(config.delivery.backoff_base, Duration::from_secs(1));

        let mesh = config.mesh.unwrap();
        assert_eq!(mesh.seeds.len(), 1);
        let relay = config.relay.unwrap();
        assert!(relay.insecure_skip_verify);
        assert_eq!(relay.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("[router]\nmax_hops = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("max_payload_bytes = 1000000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str(
                "[router]\nretransmit_after = 3000\n[delivery]\nack_timeout = 2000\nbackoff_base = 1000"
            ),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("max_hops = [1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
