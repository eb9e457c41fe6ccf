//! relaydm relay engine
//!
//! Connects to a set of relays, publishes and subscribes across them, keeps a
//! persisted queue of conversation messages and drives the encrypted
//! direct-message send and receive paths.
//!
//! ```text
//! DmController ── MessageQueue ── MessageStore
//!      │               │
//!      └────── RelayPool ── RelayConnection × N ── RelayTransport
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection;
pub mod dedup;
pub mod dm;
pub mod error;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod relay_manager;
pub mod store;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{DmConfig, PoolConfig, QueueConfig, RelayConfig};
pub use connection::{ConnectionStatus, RelayConnection, RelayEvent, RelayEventKind};
pub use dm::{
    DmController, DmDependencies, DmNotification, DmSnapshot, DmStats, DmStatus, SendDmResult,
    SyncReport,
};
pub use error::{EngineError, Result, TransportError};
pub use pool::{
    NetworkState, PoolNotification, PublishResult, RelayPool, RelayPublishStatus, RelayState,
    Subscription, SubscriptionItem,
};
pub use providers::{
    AcceptAll, EnvKeyProvider, KeyProvider, PeerTrustStore, StaticKeyProvider, TrustStore,
    SECRET_KEY_ENV,
};
pub use queue::{MessageQueue, MissedEvents, QueueReport, QueueStats};
pub use relay_manager::{RelayHealth, RelayInfo, RelayManager, RelayManagerStats, RelayStats};
pub use store::{FileMessageStore, MemoryMessageStore, MessageStore, StoredMessage};
pub use transport::{RelayTransport, TransportEvent, TransportLink, WebSocketTransport};
