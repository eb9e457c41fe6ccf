//! Shared data types for relaydm
//!
//! Timestamps, event kinds, subscription and conversation identifiers, and
//! the conversation-level `Message` record handed to the application.

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::event::Event;

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Unix timestamp in seconds, as carried in `created_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Timestamp `secs` seconds earlier, saturating at the epoch
    pub fn saturating_sub_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Event Kind
// ----------------------------------------------------------------------------

/// Numeric event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(u16);

impl Kind {
    /// Short text note, the default kind for new events
    pub const TEXT_NOTE: Kind = Kind(1);
    /// Encrypted direct message (AES-256-CBC payload)
    pub const ENCRYPTED_DIRECT_MESSAGE: Kind = Kind(4);

    pub const fn new(kind: u16) -> Self {
        Self(kind)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::TEXT_NOTE
    }
}

impl From<u16> for Kind {
    fn from(kind: u16) -> Self {
        Self(kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Subscription Identifier
// ----------------------------------------------------------------------------

/// Client-chosen identifier for a relay subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Random 16-character hex identifier
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Conversation Identifier
// ----------------------------------------------------------------------------

/// Separator between the two participant keys in a conversation id
pub const CONVERSATION_ID_SEPARATOR: char = ':';

/// Order-independent identifier for a pairwise conversation.
///
/// Both participants compute the same id: the two lowercase public keys are
/// sorted and joined with [`CONVERSATION_ID_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(a: &str, b: &str) -> Self {
        let a = a.to_ascii_lowercase();
        let b = b.to_ascii_lowercase();
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{CONVERSATION_ID_SEPARATOR}{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `pubkey` is one of the two participants
    pub fn involves(&self, pubkey: &str) -> bool {
        let pubkey = pubkey.to_ascii_lowercase();
        self.0
            .split(CONVERSATION_ID_SEPARATOR)
            .any(|participant| participant == pubkey)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Delivery state of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Handed to the relay pool, awaiting acknowledgements
    Sending,
    /// At least one relay acknowledged the event
    Accepted,
    /// Relays explicitly refused the event and none accepted it
    Rejected,
    /// No relay reachable or every attempt failed; held for replay
    Queued,
    /// Received from a relay and decrypted
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "Sending",
            MessageStatus::Accepted => "Accepted",
            MessageStatus::Rejected => "Rejected",
            MessageStatus::Queued => "Queued",
            MessageStatus::Delivered => "Delivered",
        }
    }

    /// Whether the message may be handed to the pool again
    pub fn is_retryable(&self) -> bool {
        matches!(self, MessageStatus::Rejected | MessageStatus::Queued)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plaintext direct message within a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Id of the carrying event
    pub id: String,
    pub conversation_id: ConversationId,
    /// Public key of the other participant
    pub peer: String,
    pub content: String,
    pub status: MessageStatus,
    pub is_outgoing: bool,
    pub timestamp: Timestamp,
}

impl Message {
    /// Build the record for a locally authored event addressed to `peer`
    pub fn outgoing(event: &Event, peer: &str, content: &str, status: MessageStatus) -> Self {
        Self {
            id: event.id().to_string(),
            conversation_id: ConversationId::new(event.pubkey(), peer),
            peer: peer.to_ascii_lowercase(),
            content: content.to_string(),
            status,
            is_outgoing: true,
            timestamp: event.created_at(),
        }
    }

    /// Build the record for an event received from `peer`
    pub fn incoming(event: &Event, local_pubkey: &str, content: String) -> Self {
        Self {
            id: event.id().to_string(),
            conversation_id: ConversationId::new(local_pubkey, event.pubkey()),
            peer: event.pubkey().to_string(),
            content,
            status: MessageStatus::Delivered,
            is_outgoing: false,
            timestamp: event.created_at(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_order_independent() {
        let alice = "a".repeat(64);
        let bob = "B".repeat(64);

        let from_alice = ConversationId::new(&alice, &bob);
        let from_bob = ConversationId::new(&bob, &alice);

        assert_eq!(from_alice, from_bob);
        assert_eq!(from_alice.as_str(), format!("{}:{}", alice, "b".repeat(64)));
        assert!(from_alice.involves(&bob));
        assert!(!from_alice.involves(&"c".repeat(64)));
    }

    #[test]
    fn test_subscription_id_generation() {
        let first = SubscriptionId::generate();
        let second = SubscriptionId::generate();
        assert_eq!(first.as_str().len(), 16);
        assert_ne!(first, second);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(MessageStatus::Queued.is_retryable());
        assert!(MessageStatus::Rejected.is_retryable());
        assert!(!MessageStatus::Accepted.is_retryable());
        assert!(!MessageStatus::Sending.is_retryable());
        assert!(!MessageStatus::Delivered.is_retryable());
    }

    #[test]
    fn test_kind_serializes_as_number() {
        let json = serde_json::to_string(&Kind::ENCRYPTED_DIRECT_MESSAGE).unwrap();
        assert_eq!(json, "4");
        assert_eq!(Kind::default(), Kind::TEXT_NOTE);
    }
}
