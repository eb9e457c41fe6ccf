//! Key and trust providers injected into the DM controller

use std::collections::HashSet;

use async_trait::async_trait;
use relaydm_core::Keys;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Environment variable read by [`EnvKeyProvider`]
pub const SECRET_KEY_ENV: &str = "RELAYDM_SECRET_KEY";

// ----------------------------------------------------------------------------
// Key Providers
// ----------------------------------------------------------------------------

/// Source of the local signing keys
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn load_keys(&self) -> Result<Keys>;
}

/// Keys held in memory
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    keys: Keys,
}

impl StaticKeyProvider {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn load_keys(&self) -> Result<Keys> {
        Ok(self.keys.clone())
    }
}

/// Secret key read from an environment variable as hex
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    variable: String,
}

impl EnvKeyProvider {
    pub fn new<S: Into<String>>(variable: S) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new(SECRET_KEY_ENV)
    }
}

#[async_trait]
impl KeyProvider for EnvKeyProvider {
    async fn load_keys(&self) -> Result<Keys> {
        let value = std::env::var(&self.variable)
            .map_err(|_| EngineError::Key(format!("{} is not set", self.variable)))?;
        Keys::parse(value.trim())
            .map_err(|e| EngineError::Key(format!("{}: {}", self.variable, e)))
    }
}

// ----------------------------------------------------------------------------
// Trust
// ----------------------------------------------------------------------------

/// Decides whether messages from a sender are accepted
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn is_accepted(&self, pubkey: &str) -> bool;
}

/// Accepts every sender
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl TrustStore for AcceptAll {
    async fn is_accepted(&self, _pubkey: &str) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct PeerLists {
    trusted: HashSet<String>,
    blocked: HashSet<String>,
}

/// Block list plus an optional allow list.
///
/// Blocked keys are always refused. Unknown keys are accepted unless the
/// store was built with [`PeerTrustStore::trusted_only`].
#[derive(Debug, Default)]
pub struct PeerTrustStore {
    lists: RwLock<PeerLists>,
    trusted_only: bool,
}

impl PeerTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trusted_only() -> Self {
        Self {
            trusted_only: true,
            ..Self::default()
        }
    }

    pub async fn trust(&self, pubkey: &str) {
        let key = pubkey.to_ascii_lowercase();
        let mut lists = self.lists.write().await;
        lists.blocked.remove(&key);
        lists.trusted.insert(key);
    }

    pub async fn block(&self, pubkey: &str) {
        let key = pubkey.to_ascii_lowercase();
        let mut lists = self.lists.write().await;
        lists.trusted.remove(&key);
        lists.blocked.insert(key);
    }

    pub async fn unblock(&self, pubkey: &str) -> bool {
        self.lists
            .write()
            .await
            .blocked
            .remove(&pubkey.to_ascii_lowercase())
    }
}

#[async_trait]
impl TrustStore for PeerTrustStore {
    async fn is_accepted(&self, pubkey: &str) -> bool {
        let key = pubkey.to_ascii_lowercase();
        let lists = self.lists.read().await;
        if lists.blocked.contains(&key) {
            debug!("Sender {} is blocked", key);
            return false;
        }
        !self.trusted_only || lists.trusted.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_keys() {
        let keys = Keys::generate();
        let provider = StaticKeyProvider::new(keys.clone());
        let loaded = provider.load_keys().await.unwrap();
        assert_eq!(loaded.public_key_hex(), keys.public_key_hex());
    }

    #[tokio::test]
    async fn test_env_provider_missing_variable() {
        let provider = EnvKeyProvider::new("RELAYDM_TEST_UNSET_SECRET_KEY");
        assert!(matches!(provider.load_keys().await, Err(EngineError::Key(_))));
    }

    #[tokio::test]
    async fn test_block_overrides_trust() {
        let store = PeerTrustStore::new();
        assert!(store.is_accepted("AA").await);

        store.trust("aa").await;
        store.block("AA").await;
        assert!(!store.is_accepted("aa").await);

        assert!(store.unblock("aa").await);
        assert!(store.is_accepted("aa").await);
    }

    #[tokio::test]
    async fn test_trusted_only_refuses_unknown() {
        let store = PeerTrustStore::trusted_only();
        assert!(!store.is_accepted("bb").await);
        store.trust("bb").await;
        assert!(store.is_accepted("bb").await);
        assert!(AcceptAll.is_accepted("cc").await);
    }
}
