//! Signed relay events
//!
//! An event's id is the SHA-256 of its canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]` (compact JSON, UTF-8), and
//! `sig` is a schnorr signature of that id under `pubkey`. Events are only
//! built through [`EventBuilder`] or parsed from JSON, so a constructed event
//! always carries an id matching its contents.

use core::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{self, Keys};
use crate::errors::{CoreError, CryptoError, Result};
use crate::types::{Kind, Timestamp};

// ----------------------------------------------------------------------------
// Tags
// ----------------------------------------------------------------------------

/// Tag name referencing a public key
pub const PUBLIC_KEY_TAG: &str = "p";
/// Tag name referencing another event
pub const EVENT_TAG: &str = "e";

/// An event tag: a name followed by its values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// `["p", <pubkey>]`
    pub fn public_key(pubkey: &str) -> Self {
        Self(vec![PUBLIC_KEY_TAG.to_string(), pubkey.to_string()])
    }

    /// `["e", <event id>]`
    pub fn event(event_id: &str) -> Self {
        Self(vec![EVENT_TAG.to_string(), event_id.to_string()])
    }

    /// Tag name, if any
    pub fn kind(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name
    pub fn content(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Event
// ----------------------------------------------------------------------------

/// A signed event as exchanged with relays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: String,
    pubkey: String,
    created_at: Timestamp,
    kind: Kind,
    tags: Vec<Tag>,
    content: String,
    sig: String,
}

impl Event {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sig(&self) -> &str {
        &self.sig
    }

    /// Values of every `p` tag, in tag order
    pub fn public_keys(&self) -> impl Iterator<Item = &str> {
        self.tag_values(PUBLIC_KEY_TAG)
    }

    /// Values of every `e` tag, in tag order
    pub fn event_ids(&self) -> impl Iterator<Item = &str> {
        self.tag_values(EVENT_TAG)
    }

    fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |tag| tag.kind() == Some(name))
            .filter_map(Tag::content)
    }

    /// Recompute the canonical id from this event's fields
    pub fn compute_id(&self) -> Result<String> {
        canonical_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
        .map(hex::encode)
    }

    /// Check that the id is exactly the lowercase canonical hash and the
    /// signature verifies. Ids are dedup keys, so other spellings are refused.
    pub fn verify(&self) -> Result<()> {
        let expected = self.compute_id()?;
        if expected != self.id {
            return Err(CryptoError::IdMismatch.into());
        }

        let digest: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CryptoError::IdMismatch)?;

        crypto::verify_digest(&self.pubkey, &digest, &self.sig)?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Parse an event from its JSON object form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// SHA-256 of `[0, pubkey, created_at, kind, tags, content]`
fn canonical_id(
    pubkey: &str,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let serialized = serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content))?;
    Ok(Sha256::digest(&serialized).into())
}

// ----------------------------------------------------------------------------
// Unsigned Event
// ----------------------------------------------------------------------------

/// An event with its id computed but no signature yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Sign with `keys`, which must own `pubkey`
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        if !keys.public_key_hex().eq_ignore_ascii_case(&self.pubkey) {
            return Err(CoreError::invalid_event(
                "signing keys do not match the event author",
            ));
        }

        let digest: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CryptoError::IdMismatch)?;
        let signature = keys.sign_digest(&digest);

        Ok(Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(&signature[..]),
        })
    }
}

// ----------------------------------------------------------------------------
// Event Builder
// ----------------------------------------------------------------------------

/// Builder for new events
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    kind: Kind,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<Timestamp>,
}

impl EventBuilder {
    pub fn new<S: Into<String>>(kind: Kind, content: S) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn text_note<S: Into<String>>(content: S) -> Self {
        Self::new(Kind::TEXT_NOTE, content)
    }

    /// Encrypted direct message from `sender` to `receiver_pubkey`
    pub fn encrypted_direct_msg(
        sender: &Keys,
        receiver_pubkey: &str,
        plaintext: &str,
    ) -> Result<Self> {
        crypto::parse_public_key(receiver_pubkey)?;
        let shared = crypto::derive_shared_secret(&sender.secret_key(), receiver_pubkey)?;
        let payload = crypto::encrypt(plaintext, &shared);

        Ok(Self::new(Kind::ENCRYPTED_DIRECT_MESSAGE, payload)
            .tag(Tag::public_key(&receiver_pubkey.to_ascii_lowercase())))
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags<I: IntoIterator<Item = Tag>>(mut self, tags: I) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Override `created_at`, which otherwise defaults to now
    pub fn custom_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn to_unsigned_event(self, pubkey: &str) -> Result<UnsignedEvent> {
        let created_at = self.created_at.unwrap_or_else(Timestamp::now);
        let id = canonical_id(pubkey, created_at, self.kind, &self.tags, &self.content)?;

        Ok(UnsignedEvent {
            id: hex::encode(id),
            pubkey: pubkey.to_string(),
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        })
    }

    /// Build and sign with `keys`
    pub fn to_event(self, keys: &Keys) -> Result<Event> {
        self.to_unsigned_event(&keys.public_key_hex())?.sign(keys)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
