//! Relay configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! or missing file yields a working relay. The binary applies CLI and
//! environment overrides on top before calling [`RelayConfig::validate`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::{HubSettings, DEFAULT_MAX_CLIENTS};
use crate::server::{ConnectionSettings, DEFAULT_LISTEN_ADDR};

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the WebSocket ingress binds to
    pub listen: SocketAddr,

    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,

    /// Maximum number of distinct users online
    pub max_clients: usize,

    /// Seconds between server pings
    pub ping_interval_secs: u64,

    /// Seconds without any inbound frame before a connection is dropped
    pub idle_timeout_secs: u64,

    /// Largest inbound text frame accepted, in bytes
    pub max_message_bytes: usize,

    /// Push notification settings (the `[fcm]` table)
    pub fcm: FcmConfig,
}

/// Firebase Cloud Messaging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FcmConfig {
    /// Path to the service-account JSON key
    pub credentials: PathBuf,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from("./serviceAccountKey.json"),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let connection = ConnectionSettings::default();
        Self {
            listen: DEFAULT_LISTEN_ADDR,
            outbound_queue: connection.outbound_queue,
            max_clients: DEFAULT_MAX_CLIENTS,
            ping_interval_secs: connection.ping_interval.as_secs(),
            idle_timeout_secs: connection.idle_timeout.as_secs(),
            max_message_bytes: connection.max_message_bytes,
            fcm: FcmConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from `path`, or defaults when `path` is `None`.
    ///
    /// The result is not validated; call [`validate`](Self::validate) after
    /// applying overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
                Self::from_toml(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Rejects values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("outbound_queue", self.outbound_queue),
            ("max_clients", self.max_clients),
            ("max_message_bytes", self.max_message_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than 0")));
            }
        }

        if self.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ping_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.idle_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "idle_timeout_secs ({}) must be greater than ping_interval_secs ({})",
                self.idle_timeout_secs, self.ping_interval_secs
            )));
        }

        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_queue: self.outbound_queue,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_message_bytes: self.max_message_bytes,
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            max_clients: self.max_clients,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
