//! DM controller
//!
//! Orchestrates the send and receive paths for encrypted direct messages on
//! top of the relay pool and the message queue.
//!
//! Lifecycle: `Initializing -> Ready -> Subscribed <-> Unsubscribed`.
//! Subscribing while already subscribed is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use relaydm_core::crypto;
use relaydm_core::{
    ConversationId, Event, EventBuilder, Filter, Keys, Kind, Message, MessageStatus,
    SubscriptionId, Timestamp,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DmConfig;
use crate::error::{EngineError, Result};
use crate::pool::{NetworkState, PoolNotification, RelayPool, SubscriptionItem};
use crate::providers::{KeyProvider, TrustStore};
use crate::queue::{MessageQueue, QueueReport};

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmStatus {
    Initializing,
    Ready,
    Subscribed,
    Unsubscribed,
}

impl std::fmt::Display for DmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DmStatus::Initializing => "initializing",
            DmStatus::Ready => "ready",
            DmStatus::Subscribed => "subscribed",
            DmStatus::Unsubscribed => "unsubscribed",
        };
        f.write_str(name)
    }
}

/// Result of [`DmController::send_dm`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendDmResult {
    /// At least one relay accepted the message
    pub success: bool,
    pub message_id: Option<String>,
    pub status: Option<MessageStatus>,
    pub error: Option<String>,
}

impl SendDmResult {
    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            message_id: None,
            status: None,
            error: Some(error.to_string()),
        }
    }
}

/// Counts from [`DmController::sync_missed_messages`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub relays_queried: usize,
    pub fetched: usize,
    pub merged: usize,
    pub duplicates: usize,
    pub dropped: usize,
}

/// State exposed to the surrounding application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmSnapshot {
    pub status: DmStatus,
    pub messages: Vec<Message>,
    pub network_state: NetworkState,
}

/// Messages materialized or updated by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmNotification {
    MessageReceived(Message),
    MessageStatusChanged(Message),
}

/// Receive-path counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmStats {
    pub sent: u64,
    pub received: u64,
    pub duplicates: u64,
    pub dropped_untrusted: u64,
    pub dropped_undecryptable: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    dropped_untrusted: AtomicU64,
    dropped_undecryptable: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DmStats {
        DmStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped_untrusted: self.dropped_untrusted.load(Ordering::Relaxed),
            dropped_undecryptable: self.dropped_undecryptable.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IncomingOutcome {
    Stored,
    Duplicate,
    Dropped,
}

/// Services the controller is built from
pub struct DmDependencies {
    pub pool: Arc<RelayPool>,
    pub queue: Arc<MessageQueue>,
    pub keys: Arc<dyn KeyProvider>,
    pub trust: Arc<dyn TrustStore>,
}

// ----------------------------------------------------------------------------
// DM Controller
// ----------------------------------------------------------------------------

struct ActiveSubscription {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

struct DmInner {
    pool: Arc<RelayPool>,
    queue: Arc<MessageQueue>,
    key_provider: Arc<dyn KeyProvider>,
    trust: Arc<dyn TrustStore>,
    config: DmConfig,
    keys: RwLock<Option<Keys>>,
    status: watch::Sender<DmStatus>,
    subscription: Mutex<Option<ActiveSubscription>>,
    reconnect_listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    notifications: broadcast::Sender<DmNotification>,
    counters: Counters,
}

impl Drop for DmInner {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.reconnect_listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
    }
}

/// Encrypted direct-message controller. Cheap to clone.
#[derive(Clone)]
pub struct DmController {
    inner: Arc<DmInner>,
}

impl DmController {
    pub fn new(deps: DmDependencies, config: DmConfig) -> Self {
        let (status, _) = watch::channel(DmStatus::Initializing);
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            inner: Arc::new(DmInner {
                pool: deps.pool,
                queue: deps.queue,
                key_provider: deps.keys,
                trust: deps.trust,
                config,
                keys: RwLock::new(None),
                status,
                subscription: Mutex::new(None),
                reconnect_listener: std::sync::Mutex::new(None),
                notifications,
                counters: Counters::default(),
            }),
        }
    }

    /// Load keys and persisted messages, then move to `Ready`.
    ///
    /// Calling it again after success is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.status() != DmStatus::Initializing {
            return Ok(());
        }

        let keys = self.inner.key_provider.load_keys().await?;
        let restored = self.inner.queue.load().await?;
        info!(
            "DM controller for {} restored {} message(s)",
            keys.public_key_hex(),
            restored
        );
        *self.inner.keys.write().await = Some(keys);

        if self.inner.config.flush_on_reconnect {
            self.spawn_reconnect_listener();
        }
        self.inner.status.send_replace(DmStatus::Ready);
        Ok(())
    }

    fn spawn_reconnect_listener(&self) {
        let mut notifications = self.inner.pool.notifications();
        let inner = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(PoolNotification::RelayConnected { relay_url }) => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        debug!("Relay {} connected, flushing offline queue", relay_url);
                        if let Err(e) = DmController::flush_with(&inner).await {
                            warn!("Offline queue flush failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Reconnect listener skipped {} notification(s)", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut listener) = self.inner.reconnect_listener.lock() {
            if let Some(previous) = listener.replace(task) {
                previous.abort();
            }
        }
    }

    pub fn status(&self) -> DmStatus {
        *self.inner.status.borrow()
    }

    /// Watch lifecycle changes
    pub fn subscribe_status(&self) -> watch::Receiver<DmStatus> {
        self.inner.status.subscribe()
    }

    /// Observe received messages and status changes
    pub fn notifications(&self) -> broadcast::Receiver<DmNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn stats(&self) -> DmStats {
        self.inner.counters.snapshot()
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.inner.pool
    }

    /// Local public key, once initialized
    pub async fn public_key(&self) -> Option<String> {
        self.inner
            .keys
            .read()
            .await
            .as_ref()
            .map(|keys| keys.public_key_hex())
    }

    async fn keys(&self) -> Result<Keys> {
        self.inner
            .keys
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::NotReady {
                status: self.status().to_string(),
            })
    }

    fn notify(&self, notification: DmNotification) {
        let _ = self.inner.notifications.send(notification);
    }

    // ------------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------------

    /// Encrypt, sign and publish a direct message to `peer_pubkey`.
    ///
    /// Failures are reported in the result, never returned as errors.
    pub async fn send_dm(&self, peer_pubkey: &str, plaintext: &str) -> SendDmResult {
        let keys = match self.keys().await {
            Ok(keys) => keys,
            Err(e) => return SendDmResult::failed(e),
        };

        let event = match EventBuilder::encrypted_direct_msg(&keys, peer_pubkey, plaintext)
            .and_then(|builder| builder.to_event(&keys))
        {
            Ok(event) => event,
            Err(e) => {
                warn!("Cannot build direct message: {}", e);
                return SendDmResult::failed(e);
            }
        };
        let message = Message::outgoing(&event, peer_pubkey, plaintext, MessageStatus::Sending);
        let message_id = message.id.clone();

        if self.inner.pool.open_relays().await.is_empty() {
            return match self.inner.queue.queue_outgoing_message(message, event).await {
                Ok(()) => {
                    debug!("No relays open, message {} queued", message_id);
                    SendDmResult {
                        success: false,
                        message_id: Some(message_id),
                        status: Some(MessageStatus::Queued),
                        error: Some("no relays connected".to_string()),
                    }
                }
                Err(e) => SendDmResult::failed(e),
            };
        }

        if let Err(e) = self.inner.queue.begin_outgoing(message, event.clone()).await {
            return SendDmResult::failed(e);
        }

        let result = self.inner.pool.publish_to_all(&event).await;
        Counters::bump(&self.inner.counters.sent);
        match self.inner.queue.complete_send(&message_id, &result).await {
            Ok(message) => {
                let status = message.status;
                self.notify(DmNotification::MessageStatusChanged(message));
                SendDmResult {
                    success: status == MessageStatus::Accepted,
                    message_id: Some(message_id),
                    status: Some(status),
                    error: (status != MessageStatus::Accepted)
                        .then(|| result.first_error())
                        .flatten(),
                }
            }
            // The relays saw the event but its status could not be recorded
            Err(e) => SendDmResult {
                success: result.success,
                message_id: Some(message_id),
                status: Some(MessageStatus::Sending),
                error: Some(e.to_string()),
            },
        }
    }

    /// Re-attempt delivery of a `Rejected` or `Queued` message
    pub async fn retry_failed_message(&self, id: &str) -> Result<Message> {
        self.keys().await?;
        let message = self
            .inner
            .queue
            .retry_failed_message(&self.inner.pool, id)
            .await?;
        Counters::bump(&self.inner.counters.sent);
        self.notify(DmNotification::MessageStatusChanged(message.clone()));
        Ok(message)
    }

    /// Replay queued messages through the pool
    pub async fn flush_offline_queue(&self) -> Result<QueueReport> {
        self.keys().await?;
        Self::flush_with(&self.inner).await
    }

    async fn flush_with(inner: &Arc<DmInner>) -> Result<QueueReport> {
        let report = inner.queue.process_offline_queue(&inner.pool).await?;
        for message in &report.updated {
            Counters::bump(&inner.counters.sent);
            let _ = inner
                .notifications
                .send(DmNotification::MessageStatusChanged(message.clone()));
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    /// Subscribe to direct messages addressed to the local key
    pub async fn subscribe_to_incoming_dms(&self) -> Result<()> {
        let keys = self.keys().await?;
        let mut active = self.inner.subscription.lock().await;
        if active.is_some() {
            debug!("Already subscribed to incoming DMs");
            return Ok(());
        }

        let since = Timestamp::now()
            .saturating_sub_secs(self.inner.config.subscription_lookback.as_secs());
        let filter = Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .pubkey(&keys.public_key_hex())
            .since(since);

        let mut subscription = self.inner.pool.subscribe(vec![filter]).await;
        let id = subscription.id().clone();
        let inner = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            while let Some(item) = subscription.recv().await {
                match item {
                    SubscriptionItem::Event(event) => {
                        let Some(controller) = Self::upgrade(&inner) else {
                            break;
                        };
                        if let Err(e) = controller.handle_incoming(&event).await {
                            error!("Failed to store message {}: {}", event.id(), e);
                        }
                    }
                    SubscriptionItem::EndOfStoredEvents => {
                        debug!("Incoming DM subscription {} caught up", subscription.id());
                    }
                }
            }
        });

        info!("Subscribed to incoming DMs ({})", id);
        *active = Some(ActiveSubscription { id, task });
        self.inner.status.send_replace(DmStatus::Subscribed);
        Ok(())
    }

    fn upgrade(inner: &Weak<DmInner>) -> Option<DmController> {
        inner.upgrade().map(|inner| DmController { inner })
    }

    /// Cancel the incoming subscription. A relay may still deliver one late
    /// event that was already in flight.
    pub async fn unsubscribe_from_dms(&self) -> bool {
        let active = self.inner.subscription.lock().await.take();
        let Some(active) = active else {
            return false;
        };

        // Dropping the route ends the task once its channel drains
        self.inner.pool.unsubscribe(&active.id).await;
        drop(active.task);
        self.inner.status.send_replace(DmStatus::Unsubscribed);
        info!("Unsubscribed from incoming DMs ({})", active.id);
        true
    }

    /// Fetch direct messages sent to or by the local key since `since` and
    /// merge the ones not already stored
    pub async fn sync_missed_messages(&self, since: Timestamp) -> Result<SyncReport> {
        let keys = self.keys().await?;
        let missed = self
            .inner
            .queue
            .sync_missed_messages(&self.inner.pool, &keys.public_key_hex(), since)
            .await;

        let mut report = SyncReport {
            relays_queried: missed.relays_queried,
            fetched: missed.fetched,
            duplicates: missed.duplicates,
            ..Default::default()
        };
        for event in &missed.events {
            match self.handle_incoming(event).await? {
                IncomingOutcome::Stored => report.merged += 1,
                IncomingOutcome::Duplicate => report.duplicates += 1,
                IncomingOutcome::Dropped => report.dropped += 1,
            }
        }

        info!(
            "Sync since {}: {} fetched, {} merged, {} dropped",
            since, report.fetched, report.merged, report.dropped
        );
        Ok(report)
    }

    /// Validate, decrypt and store one delivered event.
    ///
    /// Undecryptable and untrusted events are logged and dropped.
    async fn handle_incoming(&self, event: &Event) -> Result<IncomingOutcome> {
        let keys = self.keys().await?;
        let local = keys.public_key_hex();
        let counters = &self.inner.counters;

        if event.kind() != Kind::ENCRYPTED_DIRECT_MESSAGE {
            debug!("Ignoring event {} of kind {}", event.id(), event.kind());
            return Ok(IncomingOutcome::Dropped);
        }

        // Messages we authored elsewhere come back through sync
        let self_authored = event.pubkey().eq_ignore_ascii_case(&local);
        let peer = if self_authored {
            match event.public_keys().next() {
                Some(peer) => peer.to_ascii_lowercase(),
                None => {
                    debug!("Own event {} has no recipient", event.id());
                    return Ok(IncomingOutcome::Dropped);
                }
            }
        } else {
            if !event.public_keys().any(|pk| pk.eq_ignore_ascii_case(&local)) {
                debug!("Event {} is not addressed to us", event.id());
                return Ok(IncomingOutcome::Dropped);
            }
            event.pubkey().to_ascii_lowercase()
        };

        if !self_authored
            && self.inner.config.verify_trust
            && !self.inner.trust.is_accepted(&peer).await
        {
            debug!("Dropping event {} from untrusted sender {}", event.id(), peer);
            Counters::bump(&counters.dropped_untrusted);
            return Ok(IncomingOutcome::Dropped);
        }

        if self.inner.queue.contains(event.id()).await {
            Counters::bump(&counters.duplicates);
            return Ok(IncomingOutcome::Duplicate);
        }

        let plaintext = match crypto::derive_shared_secret(&keys.secret_key(), &peer)
            .and_then(|key| crypto::decrypt(event.content(), &key))
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Dropping undecryptable event {} from {}: {}", event.id(), event.pubkey(), e);
                Counters::bump(&counters.dropped_undecryptable);
                return Ok(IncomingOutcome::Dropped);
            }
        };

        let message = if self_authored {
            Message::outgoing(event, &peer, &plaintext, MessageStatus::Accepted)
        } else {
            Message::incoming(event, &local, plaintext)
        };

        if !self.inner.queue.record_incoming(message.clone()).await? {
            Counters::bump(&counters.duplicates);
            return Ok(IncomingOutcome::Duplicate);
        }
        Counters::bump(&counters.received);
        debug!("Stored message {} in {}", message.id, message.conversation_id);
        self.notify(DmNotification::MessageReceived(message));
        Ok(IncomingOutcome::Stored)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn snapshot(&self) -> DmSnapshot {
        DmSnapshot {
            status: self.status(),
            messages: self.inner.queue.messages().await,
            network_state: self.inner.pool.network_state().await,
        }
    }

    pub async fn get_messages_by_conversation(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .queue
            .messages_by_conversation(conversation_id)
            .await
    }

    /// Conversation between the local key and `peer_pubkey`
    pub async fn conversation_with(&self, peer_pubkey: &str) -> Result<ConversationId> {
        let keys = self.keys().await?;
        Ok(ConversationId::new(&keys.public_key_hex(), peer_pubkey))
    }

    /// Unsubscribe and stop background work
    pub async fn shutdown(&self) {
        self.unsubscribe_from_dms().await;
        if let Ok(mut listener) = self.inner.reconnect_listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for DmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmController")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, QueueConfig};
    use crate::providers::{AcceptAll, StaticKeyProvider};
    use crate::store::MemoryMessageStore;
    use crate::transport::WebSocketTransport;

    fn controller(keys: Keys, store: Arc<MemoryMessageStore>) -> DmController {
        let pool = RelayPool::new(PoolConfig::testing(), Arc::new(WebSocketTransport::new()));
        DmController::new(
            DmDependencies {
                pool,
                queue: Arc::new(MessageQueue::new(store, QueueConfig::testing())),
                keys: Arc::new(StaticKeyProvider::new(keys)),
                trust: Arc::new(AcceptAll),
            },
            DmConfig::testing(),
        )
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let dm = controller(Keys::generate(), Arc::new(MemoryMessageStore::new()));
        assert_eq!(dm.status(), DmStatus::Initializing);

        let result = dm.send_dm(&Keys::generate().public_key_hex(), "hi").await;
        assert!(!result.success);
        assert!(result.message_id.is_none());
        assert!(matches!(
            dm.subscribe_to_incoming_dms().await,
            Err(EngineError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_without_relays_queues() {
        let store = Arc::new(MemoryMessageStore::new());
        let dm = controller(Keys::generate(), store.clone());
        dm.initialize().await.unwrap();
        assert_eq!(dm.status(), DmStatus::Ready);

        let peer = Keys::generate().public_key_hex();
        let result = dm.send_dm(&peer, "offline hello").await;
        assert!(!result.success);
        assert_eq!(result.status, Some(MessageStatus::Queued));
        assert_eq!(result.error.as_deref(), Some("no relays connected"));

        let persisted = store.snapshot().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].message.status, MessageStatus::Queued);
        assert_eq!(persisted[0].message.content, "offline hello");
    }

    #[tokio::test]
    async fn test_send_to_invalid_peer_fails_cleanly() {
        let store = Arc::new(MemoryMessageStore::new());
        let dm = controller(Keys::generate(), store.clone());
        dm.initialize().await.unwrap();

        let result = dm.send_dm("not-a-key", "hi").await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let dm = controller(Keys::generate(), Arc::new(MemoryMessageStore::new()));
        dm.initialize().await.unwrap();

        dm.subscribe_to_incoming_dms().await.unwrap();
        dm.subscribe_to_incoming_dms().await.unwrap();
        assert_eq!(dm.status(), DmStatus::Subscribed);

        assert!(dm.unsubscribe_from_dms().await);
        assert!(!dm.unsubscribe_from_dms().await);
        assert_eq!(dm.status(), DmStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn test_undecryptable_event_is_dropped() {
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let dm = controller(bob.clone(), Arc::new(MemoryMessageStore::new()));
        dm.initialize().await.unwrap();

        let garbage = EventBuilder::new(Kind::ENCRYPTED_DIRECT_MESSAGE, "AAAA?iv=AAAA")
            .tag(relaydm_core::Tag::public_key(&bob.public_key_hex()))
            .to_event(&alice)
            .unwrap();
        assert_eq!(
            dm.handle_incoming(&garbage).await.unwrap(),
            IncomingOutcome::Dropped
        );
        assert_eq!(dm.stats().dropped_undecryptable, 1);
        assert!(dm.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_and_outgoing_share_conversation() {
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let dm = controller(bob.clone(), Arc::new(MemoryMessageStore::new()));
        dm.initialize().await.unwrap();

        let incoming = EventBuilder::encrypted_direct_msg(&alice, &bob.public_key_hex(), "hey bob")
            .unwrap()
            .to_event(&alice)
            .unwrap();
        assert_eq!(dm.handle_incoming(&incoming).await.unwrap(), IncomingOutcome::Stored);
        assert_eq!(dm.handle_incoming(&incoming).await.unwrap(), IncomingOutcome::Duplicate);

        dm.send_dm(&alice.public_key_hex(), "hey alice").await;

        let conversation = dm.conversation_with(&alice.public_key_hex()).await.unwrap();
        let messages = dm.get_messages_by_conversation(&conversation).await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.content == "hey bob" && !m.is_outgoing));
        assert!(messages.iter().any(|m| m.content == "hey alice" && m.is_outgoing));
    }
}
