//! Configuration for the relay pool, offline queue and DM controller

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// Configuration for an individual relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay URL (`ws://` or `wss://`)
    pub url: String,
    /// Read-only relays receive REQs but never published events
    #[serde(default)]
    pub read_only: bool,
}

impl RelayConfig {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            read_only: false,
        }
    }

    pub fn read_only<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            read_only: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Pool Configuration
// ----------------------------------------------------------------------------

/// Configuration for the relay pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Relays the pool connects to
    pub relays: Vec<RelayConfig>,
    /// Time allowed for the transport to open
    pub connection_timeout: Duration,
    /// Per-relay wait for an `OK` after publishing
    pub ack_timeout: Duration,
    /// Upper bound on simultaneously open connections (None = all relays)
    pub max_connections: Option<usize>,
    /// Malformed frames tolerated before a connection is torn down
    pub max_protocol_violations: u32,
    /// Event ids remembered per subscription for deduplication
    pub dedup_capacity: usize,
    /// Interval of the maintenance task that reconnects due relays
    pub reconnect_interval: Duration,
    /// Exponential backoff configuration
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                RelayConfig::new("wss://relay.damus.io"),
                RelayConfig::new("wss://nos.lol"),
                RelayConfig::new("wss://relay.nostr.band"),
            ],
            connection_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            max_connections: None,
            max_protocol_violations: 5,
            dedup_capacity: 10_000,
            reconnect_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl PoolConfig {
    /// Create a configuration for local development with a local relay
    pub fn local_development() -> Self {
        Self {
            relays: vec![RelayConfig::new("ws://localhost:7777")],
            connection_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Short timeouts for tests against in-process relays
    pub fn testing() -> Self {
        Self {
            relays: Vec::new(),
            connection_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Configuration with the given relay URLs and default timeouts
    pub fn with_relays<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: urls.into_iter().map(RelayConfig::new).collect(),
            ..Self::default()
        }
    }

    /// Add a relay to the configuration
    pub fn add_relay<S: Into<String>>(&mut self, url: S) {
        self.relays.push(RelayConfig::new(url));
    }
}

// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

/// Configuration for the message queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on a historical sync, including stored-event replay
    pub sync_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(10),
        }
    }
}

impl QueueConfig {
    pub fn testing() -> Self {
        Self {
            sync_timeout: Duration::from_secs(1),
        }
    }
}

// ----------------------------------------------------------------------------
// DM Configuration
// ----------------------------------------------------------------------------

/// Configuration for the DM controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmConfig {
    /// How far back the live subscription asks relays to replay
    pub subscription_lookback: Duration,
    /// Consult the trust store before decrypting incoming messages
    pub verify_trust: bool,
    /// Replay the offline queue whenever a relay connects
    pub flush_on_reconnect: bool,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            subscription_lookback: Duration::from_secs(60 * 60 * 24),
            verify_trust: true,
            flush_on_reconnect: true,
            notification_capacity: 256,
        }
    }
}

impl DmConfig {
    pub fn testing() -> Self {
        Self {
            subscription_lookback: Duration::from_secs(60 * 60),
            ..Self::default()
        }
    }
}
