//! DM controllers wired to a mock network

use std::sync::Arc;

use relaydm_core::Keys;
use relaydm_nostr::{
    AcceptAll, DmConfig, DmController, DmDependencies, MemoryMessageStore, MessageQueue,
    QueueConfig, RelayPool, Result, StaticKeyProvider, TrustStore,
};

use crate::network::MockRelayNetwork;

/// A controller plus handles tests inspect
pub struct TestNode {
    pub keys: Keys,
    pub pool: Arc<RelayPool>,
    pub store: Arc<MemoryMessageStore>,
    pub queue: Arc<MessageQueue>,
    pub dm: DmController,
}

impl TestNode {
    /// Build an initialized node over every relay on `network`, accepting all senders
    pub async fn new(network: &Arc<MockRelayNetwork>, keys: Keys) -> Result<Self> {
        Self::with_trust(network, keys, Arc::new(AcceptAll)).await
    }

    pub async fn with_trust(
        network: &Arc<MockRelayNetwork>,
        keys: Keys,
        trust: Arc<dyn TrustStore>,
    ) -> Result<Self> {
        Self::with_store(network, keys, trust, Arc::new(MemoryMessageStore::new())).await
    }

    pub async fn with_store(
        network: &Arc<MockRelayNetwork>,
        keys: Keys,
        trust: Arc<dyn TrustStore>,
        store: Arc<MemoryMessageStore>,
    ) -> Result<Self> {
        let pool = RelayPool::new(network.pool_config().await, network.clone());
        let queue = Arc::new(MessageQueue::new(store.clone(), QueueConfig::testing()));
        let dm = DmController::new(
            DmDependencies {
                pool: pool.clone(),
                queue: queue.clone(),
                keys: Arc::new(StaticKeyProvider::new(keys.clone())),
                trust,
            },
            DmConfig::testing(),
        );
        dm.initialize().await?;

        Ok(Self {
            keys,
            pool,
            store,
            queue,
            dm,
        })
    }

    pub fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    /// Connect the pool and subscribe to incoming messages
    pub async fn go_online(&self) -> Result<usize> {
        let open = self.pool.connect().await;
        self.dm.subscribe_to_incoming_dms().await?;
        Ok(open)
    }
}
