//! Application wiring
//!
//! Builds the relay pool, persistent queue, key and trust providers and the
//! DM controller from an [`AppConfig`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relaydm_core::Keys;
use relaydm_nostr::{
    DmController, DmDependencies, EnvKeyProvider, FileMessageStore, KeyProvider, MessageQueue,
    MessageStore, PeerTrustStore, RelayPool, RelayTransport, StaticKeyProvider, WebSocketTransport,
};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// A running relaydm client
pub struct RelaydmApp {
    config: AppConfig,
    pool: Arc<RelayPool>,
    controller: DmController,
    maintenance: Option<JoinHandle<()>>,
}

impl RelaydmApp {
    /// Build the client over WebSockets with the on-disk message store
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(FileMessageStore::new(config.store_path()));
        Self::with_parts(config, Arc::new(WebSocketTransport::new()), store).await
    }

    /// Build the client over any transport and store
    pub async fn with_parts(
        config: AppConfig,
        transport: Arc<dyn RelayTransport>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = RelayPool::new(config.pool_config(), transport);
        let queue = Arc::new(MessageQueue::new(store, config.queue_config()));
        let controller = DmController::new(
            DmDependencies {
                pool: Arc::clone(&pool),
                queue,
                keys: key_provider(&config)?,
                trust: Arc::new(trust_store(&config).await),
            },
            config.dm_config(),
        );

        controller.initialize().await.map_err(|e| match e {
            relaydm_nostr::EngineError::Key(reason) => CliError::MissingKey(reason),
            other => other.into(),
        })?;

        Ok(Self {
            config,
            pool,
            controller,
            maintenance: None,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &DmController {
        &self.controller
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Connect to the configured relays and keep reconnecting in the background
    pub async fn start(&mut self) -> Result<usize> {
        info!("Connecting to {} relay(s)", self.config.relays.len());
        let connected = self.pool.connect().await;
        if connected == 0 {
            warn!("No relay reachable; outgoing messages will be queued");
        } else {
            info!("Connected to {} relay(s)", connected);
        }

        if self.maintenance.is_none() {
            self.maintenance = Some(self.pool.spawn_maintenance());
        }
        Ok(connected)
    }

    /// Stop background work and close relay connections
    pub async fn stop(&mut self) {
        debug!("Stopping relaydm client");
        self.controller.shutdown().await;
        if let Some(task) = self.maintenance.take() {
            task.abort();
        }
        self.pool.disconnect().await;
    }
}

fn key_provider(config: &AppConfig) -> Result<Arc<dyn KeyProvider>> {
    match &config.secret_key {
        Some(secret) => {
            let keys = Keys::parse(secret.trim())
                .map_err(|e| CliError::Config(format!("invalid secret_key: {}", e)))?;
            Ok(Arc::new(StaticKeyProvider::new(keys)))
        }
        None => Ok(Arc::new(EnvKeyProvider::default())),
    }
}

async fn trust_store(config: &AppConfig) -> PeerTrustStore {
    let settings = &config.messages;
    let store = if settings.trusted_only {
        PeerTrustStore::trusted_only()
    } else {
        PeerTrustStore::new()
    };
    for pubkey in &settings.trusted {
        store.trust(pubkey).await;
    }
    for pubkey in &settings.blocked {
        store.block(pubkey).await;
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydm_nostr::TrustStore;

    #[test]
    fn test_invalid_secret_key_is_config_error() {
        let config = AppConfig {
            secret_key: Some("not hex".into()),
            ..AppConfig::default()
        };
        assert!(matches!(key_provider(&config), Err(CliError::Config(_))));
    }

    #[tokio::test]
    async fn test_trust_store_from_config() {
        let mut config = AppConfig::default();
        config.messages.trusted_only = true;
        config.messages.trusted = vec!["AA".into()];
        config.messages.blocked = vec!["bb".into()];

        let store = trust_store(&config).await;
        assert!(store.is_accepted("aa").await);
        assert!(!store.is_accepted("bb").await);
        assert!(!store.is_accepted("cc").await);
    }
}
