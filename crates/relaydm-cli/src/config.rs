//! CLI configuration
//!
//! Loaded from a TOML file (`relaydm.toml` under the platform config
//! directory by default) and overridden by command-line flags. The secret key
//! may live in the file or in `RELAYDM_SECRET_KEY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relaydm_nostr::{DmConfig, PoolConfig, QueueConfig, RelayConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

const APP_DIR: &str = "relaydm";
const CONFIG_FILE: &str = "relaydm.toml";
const STORE_FILE: &str = "messages.json";

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Secret key (hex); `RELAYDM_SECRET_KEY` is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Directory holding the message store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub relays: Vec<RelayConfig>,
    pub network: NetworkSettings,
    pub messages: MessageSettings,
}

/// Relay pool timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub connection_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    pub sync_timeout_secs: u64,
}

/// DM controller behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    /// How far back the live subscription reaches
    pub lookback_hours: u64,
    /// Only accept messages from `trusted` keys
    pub trusted_only: bool,
    pub trusted: Vec<String>,
    pub blocked: Vec<String>,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            data_dir: None,
            relays: PoolConfig::default().relays,
            network: NetworkSettings::default(),
            messages: MessageSettings::default(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            connection_timeout_secs: pool.connection_timeout.as_secs(),
            ack_timeout_secs: pool.ack_timeout.as_secs(),
            max_connections: pool.max_connections,
            sync_timeout_secs: QueueConfig::default().sync_timeout.as_secs(),
        }
    }
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            lookback_hours: DmConfig::default().subscription_lookback.as_secs() / 3600,
            trusted_only: false,
            trusted: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Loading and Conversion
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Platform default location of the configuration file
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load `path`, or defaults when the file does not exist
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for relay in &self.relays {
            if !(relay.url.starts_with("ws://") || relay.url.starts_with("wss://")) {
                return Err(CliError::Config(format!(
                    "relay URL must use ws:// or wss://: {}",
                    relay.url
                )));
            }
        }
        if self.network.ack_timeout_secs == 0 || self.network.connection_timeout_secs == 0 {
            return Err(CliError::Config("timeouts must be at least one second".into()));
        }
        Ok(())
    }

    /// Replace the relay set with `urls`
    pub fn override_relays(&mut self, urls: &[String]) {
        if !urls.is_empty() {
            self.relays = urls.iter().map(RelayConfig::new).collect();
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR)))
            .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join(STORE_FILE)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            relays: self.relays.clone(),
            connection_timeout: Duration::from_secs(self.network.connection_timeout_secs),
            ack_timeout: Duration::from_secs(self.network.ack_timeout_secs),
            max_connections: self.network.max_connections,
            ..PoolConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            sync_timeout: Duration::from_secs(self.network.sync_timeout_secs),
        }
    }

    pub fn dm_config(&self) -> DmConfig {
        DmConfig {
            subscription_lookback: Duration::from_secs(self.messages.lookback_hours * 3600),
            ..DmConfig::default()
        }
    }
}
