//! Router configuration.
//!
//! Loaded from an optional YAML file and overridden by CLI flags in the
//! daemon binary. Every section has serde defaults so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```yaml
//! router:
//!   port: 6783
//!   nickname: "host-a"
//!   conn_limit: 30
//! connection:
//!   heartbeat_secs: 10
//! peers:
//!   - "10.0.0.2:6783"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default TCP/UDP port.
pub const DEFAULT_PORT: u16 = 6783;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Router identity and listener settings (`router.*`).
    #[serde(default)]
    pub router: RouterConfig,

    /// Connection timing knobs (`connection.*`).
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// MAC cache settings (`mac_cache.*`).
    #[serde(default)]
    pub mac_cache: MacCacheConfig,

    /// Gossip settings (`gossip.*`).
    #[serde(default)]
    pub gossip: GossipConfig,

    /// Initial peer addresses to connect to.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Config {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Router identity and listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// TCP listen port; the UDP data socket binds the same number.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Human-readable nickname shown in diagnostics; defaults to the
    /// peer name when absent.
    #[serde(default)]
    pub nickname: Option<String>,

    /// Fixed peer name; generated randomly when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Shared secret enabling encrypted transport. No password, no crypto.
    #[serde(default)]
    pub password: Option<String>,

    /// Ceiling on established connections. Checked before accepting and
    /// before dialing, so handshakes already in flight may briefly push
    /// the total past it.
    #[serde(default = "default_conn_limit")]
    pub conn_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            nickname: None,
            name: None,
            password: None,
            conn_limit: default_conn_limit(),
        }
    }
}

/// Connection timing knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Steady-state heartbeat interval, seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Seconds without a heartbeat before the connection is declared dead.
    /// Must comfortably exceed `heartbeat_secs`.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// First reconnect delay after a failed or lost connection, seconds.
    #[serde(default = "default_retry_initial_secs")]
    pub retry_initial_secs: u64,

    /// Reconnect backoff ceiling, seconds.
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

impl ConnectionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_secs(self.retry_initial_secs)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            retry_initial_secs: default_retry_initial_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

/// MAC cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacCacheConfig {
    /// Entry lifetime, seconds. Should exceed ARP cache expiry on the
    /// underlying network (3/2 × base_reachable_time on Linux) so local
    /// hosts never see the overlay forget a MAC they still cache.
    #[serde(default = "default_mac_max_age_secs")]
    pub max_age_secs: u64,

    /// Sweep interval, seconds. Much smaller than `max_age_secs`.
    #[serde(default = "default_mac_sweep_secs")]
    pub sweep_secs: u64,
}

impl MacCacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}

impl Default for MacCacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_mac_max_age_secs(),
            sweep_secs: default_mac_sweep_secs(),
        }
    }
}

/// Gossip settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GossipConfig {
    /// Periodic full-state gossip interval, seconds.
    #[serde(default = "default_gossip_secs")]
    pub interval_secs: u64,
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gossip_secs(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_conn_limit() -> usize {
    30
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    20
}

fn default_retry_initial_secs() -> u64 {
    2
}

fn default_retry_max_secs() -> u64 {
    300
}

fn default_mac_max_age_secs() -> u64 {
    600
}

fn default_mac_sweep_secs() -> u64 {
    60
}

fn default_gossip_secs() -> u64 {
    30
}
