//! Relay configuration
//!
//! All tunables of the relay live in one [`RelayConfig`] value that is handed
//! to the connection manager at construction and can be swapped at runtime via
//! `ConnectionManager::set_config`. Values are read from a TOML file; every
//! field has a default so a missing or partial file still yields a usable
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::ClientSettings;

const CONFIG_DIR: &str = "pubsub-relay";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

/// Timing and broker settings for the relay.
///
/// Durations are stored as plain integers so the TOML file stays readable.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Period of the liveness probe in milliseconds
    pub check_interval_ms: u64,

    /// Delay applied to connect/disconnect commands before they execute
    ///
    /// A newer connect or disconnect arriving inside this window replaces the
    /// pending one.
    pub debounce_ms: u64,

    /// Wait between the first subscribe acknowledgement and arming the probe
    pub subscribe_grace_ms: u64,

    /// Constant backoff the broker client waits before reconnecting
    pub reconnect_delay_secs: u64,

    /// How long a publish may stay unconfirmed before it counts as timed out
    pub command_timeout_ms: u64,

    pub keep_alive_secs: u64,

    /// Prefix for the client identifiers presented to the broker
    pub client_id: String,

    /// Capacity of the request queue between a broker session and its driver
    pub request_capacity: usize,

    /// Number of events buffered per host listener before old ones are dropped
    pub event_capacity: usize,

    /// Inbound payloads containing this token wake the presentation layer
    pub wake_marker: String,

    /// Port used when a connect command omits one
    pub default_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 20 * 60 * 1000,
            debounce_ms: 500,
            subscribe_grace_ms: 1000,
            reconnect_delay_secs: 10,
            command_timeout_ms: 5000,
            keep_alive_secs: 5,
            client_id: "pubsub-relay".to_string(),
            request_capacity: 100,
            event_capacity: 256,
            wake_marker: "ShowMain".to_string(),
            default_port: 1883,
        }
    }
}

impl RelayConfig {
    pub fn check_interval(&self) -> Duration {
        // tokio intervals reject a zero period
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn subscribe_grace(&self) -> Duration {
        Duration::from_millis(self.subscribe_grace_ms)
    }

    /// Settings handed to the broker client when a connection is constructed.
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            client_id: self.client_id.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(1)),
            request_capacity: self.request_capacity.max(1),
        }
    }

    /// Default location: `<config dir>/pubsub-relay/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Parses a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the configuration at `path`.
    ///
    /// A file that does not exist yields the defaults; a file that exists but
    /// cannot be read or parsed is an error.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let config = Self::from_toml_str(&content, path)?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
