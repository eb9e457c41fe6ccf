//! relaydm core
//!
//! Foundational types for the relaydm direct-message engine: secp256k1 keys
//! and the encrypted DM payload, signed events and their canonical ids,
//! subscription filters, and the JSON frames exchanged with relays.
//!
//! Nothing here performs I/O; connections, pools and queues live in
//! `relaydm-nostr`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod crypto;
pub mod errors;
pub mod event;
pub mod filter;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use crypto::Keys;
pub use errors::{CoreError, CryptoError, Result};
pub use event::{Event, EventBuilder, Tag, UnsignedEvent};
pub use filter::Filter;
pub use types::{
    ConversationId, Kind, Message, MessageStatus, SubscriptionId, Timestamp,
};
pub use wire::{ClientMessage, RelayMessage};
