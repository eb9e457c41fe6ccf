//! Message queue and offline store
//!
//! Tracks every conversation message and the delivery state of outgoing ones:
//!
//! ```text
//! Sending -> Accepted | Rejected | Queued
//! Rejected | Queued -> Sending   (retry or offline replay)
//! ```
//!
//! The persisted snapshot is the source of truth. Every transition is written
//! to the store before the in-memory state changes, under one lock, so a
//! failed write leaves memory untouched. A message id is claimed before it
//! is handed to the pool and released when the publish result is recorded;
//! a second claim on the same id fails instead of sending twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relaydm_core::{ConversationId, Event, Filter, Kind, Message, MessageStatus, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::pool::{PublishResult, RelayPool};
use crate::store::{MessageStore, StoredMessage};

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// Outcome of one offline-queue replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub attempted: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub still_queued: usize,
    /// Messages skipped because another send was in flight
    pub skipped: usize,
    /// Messages whose status changed during the replay
    pub updated: Vec<Message>,
}

/// Events recovered by a historical sync, minus ones already stored
#[derive(Debug, Clone, Default)]
pub struct MissedEvents {
    pub relays_queried: usize,
    pub fetched: usize,
    pub duplicates: usize,
    pub events: Vec<Event>,
}

/// Message counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub sending: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub queued: usize,
    pub delivered: usize,
}

// ----------------------------------------------------------------------------
// Message Queue
// ----------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, StoredMessage>,
    next_sequence: u64,
    in_flight: HashSet<String>,
}

impl QueueState {
    fn snapshot_with(&self, entry: StoredMessage) -> Vec<StoredMessage> {
        let mut entries = self.entries.clone();
        entries.insert(entry.message.id.clone(), entry);
        sorted(entries.into_values())
    }
}

fn sorted(entries: impl IntoIterator<Item = StoredMessage>) -> Vec<StoredMessage> {
    let mut entries: Vec<StoredMessage> = entries.into_iter().collect();
    entries.sort_by_key(|entry| entry.sequence);
    entries
}

/// Persisted queue of conversation messages
pub struct MessageQueue {
    store: Arc<dyn MessageStore>,
    state: Mutex<QueueState>,
    config: QueueConfig,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn MessageStore>, config: QueueConfig) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            config,
        }
    }

    /// Load the persisted snapshot, replacing in-memory state.
    ///
    /// Messages left `Sending` by an interrupted process become `Queued`.
    pub async fn load(&self) -> Result<usize> {
        let mut stored = self.store.load().await?;
        let mut recovered = 0;
        for entry in &mut stored {
            if entry.message.status == MessageStatus::Sending {
                entry.message.status = MessageStatus::Queued;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted send(s) as queued", recovered);
            self.store.save(&stored).await?;
        }

        let mut state = self.state.lock().await;
        state.next_sequence = stored.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        state.entries = stored
            .into_iter()
            .map(|entry| (entry.message.id.clone(), entry))
            .collect();
        state.in_flight.clear();
        Ok(state.entries.len())
    }

    /// Write `entry` through to the store, then into memory
    async fn commit(&self, state: &mut QueueState, entry: StoredMessage) -> Result<()> {
        let snapshot = state.snapshot_with(entry.clone());
        if let Err(e) = self.store.save(&snapshot).await {
            error!("Failed to persist message {}: {}", entry.message.id, e);
            return Err(e);
        }
        debug!("Message {} is {}", entry.message.id, entry.message.status);
        state.entries.insert(entry.message.id.clone(), entry);
        Ok(())
    }

    async fn insert_new(
        &self,
        message: Message,
        event: Option<Event>,
        status: MessageStatus,
        claim: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&message.id) {
            return Err(EngineError::AlreadyInFlight { id: message.id });
        }

        let id = message.id.clone();
        let entry = StoredMessage {
            message: Message { status, ..message },
            event,
            sequence: state.next_sequence,
            attempts: u32::from(claim),
            last_error: None,
        };
        self.commit(&mut state, entry).await?;
        state.next_sequence += 1;
        if claim {
            state.in_flight.insert(id);
        }
        Ok(())
    }

    /// Record a new outgoing message as `Sending` and claim it for publishing
    pub async fn begin_outgoing(&self, message: Message, event: Event) -> Result<()> {
        self.insert_new(message, Some(event), MessageStatus::Sending, true)
            .await
    }

    /// Persist an outgoing message as `Queued` for later replay
    pub async fn queue_outgoing_message(&self, message: Message, event: Event) -> Result<()> {
        self.insert_new(message, Some(event), MessageStatus::Queued, false)
            .await
    }

    /// Move a `Queued` or `Rejected` message to `Sending` and claim it.
    ///
    /// Returns the signed event to publish.
    pub async fn claim_for_send(&self, id: &str) -> Result<Event> {
        let mut state = self.state.lock().await;
        if state.in_flight.contains(id) {
            return Err(EngineError::AlreadyInFlight { id: id.to_string() });
        }

        let current = state
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::MessageNotFound { id: id.to_string() })?;

        // Sending without a claim is left over from an interrupted attempt
        let claimable = current.message.status.is_retryable()
            || current.message.status == MessageStatus::Sending;
        let event = match (&current.event, claimable && current.message.is_outgoing) {
            (Some(event), true) => event.clone(),
            _ => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from: current.message.status,
                    to: MessageStatus::Sending,
                })
            }
        };

        let mut updated = current;
        updated.message.status = MessageStatus::Sending;
        updated.attempts = updated.attempts.saturating_add(1);
        self.commit(&mut state, updated).await?;
        state.in_flight.insert(id.to_string());
        Ok(event)
    }

    /// Record the pool's verdict for a claimed message and release the claim
    pub async fn complete_send(&self, id: &str, result: &PublishResult) -> Result<Message> {
        let mut state = self.state.lock().await;
        let was_claimed = state.in_flight.remove(id);

        let current = state
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::MessageNotFound { id: id.to_string() })?;
        let status = result.disposition();
        if !was_claimed || current.message.status != MessageStatus::Sending {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from: current.message.status,
                to: status,
            });
        }

        let mut updated = current;
        updated.message.status = status;
        updated.last_error = match status {
            MessageStatus::Accepted => None,
            _ => result.first_error(),
        };
        let message = updated.message.clone();
        self.commit(&mut state, updated).await?;
        Ok(message)
    }

    /// Publish a claimed message and record the outcome
    async fn send_claimed(&self, pool: &RelayPool, id: &str, event: &Event) -> Result<Message> {
        let result = pool.publish_to_all(event).await;
        self.complete_send(id, &result).await
    }

    /// Replay every `Queued` message through the pool in enqueue order.
    ///
    /// Messages that fail again stay `Queued`. A persistence failure stops
    /// the replay and is returned.
    pub async fn process_offline_queue(&self, pool: &RelayPool) -> Result<QueueReport> {
        let queued: Vec<String> = {
            let state = self.state.lock().await;
            sorted(
                state
                    .entries
                    .values()
                    .filter(|entry| entry.message.status == MessageStatus::Queued)
                    .cloned(),
            )
            .into_iter()
            .map(|entry| entry.message.id)
            .collect()
        };

        let mut report = QueueReport::default();
        if queued.is_empty() {
            return Ok(report);
        }
        if pool.open_relays().await.is_empty() {
            debug!("No relays open, {} message(s) stay queued", queued.len());
            report.still_queued = queued.len();
            return Ok(report);
        }

        info!("Replaying {} queued message(s)", queued.len());
        for id in queued {
            let event = match self.claim_for_send(&id).await {
                Ok(event) => event,
                Err(EngineError::AlreadyInFlight { .. }) => {
                    report.skipped += 1;
                    continue;
                }
                // Status changed since the scan, e.g. a concurrent retry landed
                Err(EngineError::InvalidTransition { .. }) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            report.attempted += 1;
            let message = self.send_claimed(pool, &id, &event).await?;
            match message.status {
                MessageStatus::Accepted => report.accepted += 1,
                MessageStatus::Rejected => report.rejected += 1,
                _ => report.still_queued += 1,
            }
            report.updated.push(message);
        }

        info!(
            "Offline queue replay: {} accepted, {} rejected, {} still queued",
            report.accepted, report.rejected, report.still_queued
        );
        Ok(report)
    }

    /// Move a `Rejected` or `Queued` message back to `Sending` and publish it
    pub async fn retry_failed_message(&self, pool: &RelayPool, id: &str) -> Result<Message> {
        let event = self.claim_for_send(id).await?;
        debug!("Retrying message {}", id);
        self.send_claimed(pool, id, &event).await
    }

    /// Store a message received from a relay, keeping its status.
    ///
    /// Returns false if its id is already known.
    pub async fn record_incoming(&self, message: Message) -> Result<bool> {
        let status = message.status;
        match self.insert_new(message, None, status, false).await {
            Ok(()) => Ok(true),
            Err(EngineError::AlreadyInFlight { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Query relays for direct messages to or from `local_pubkey` since
    /// `since`, returning only events not already stored
    pub async fn sync_missed_messages(
        &self,
        pool: &RelayPool,
        local_pubkey: &str,
        since: Timestamp,
    ) -> MissedEvents {
        let filters = vec![
            Filter::new()
                .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
                .pubkey(local_pubkey)
                .since(since),
            Filter::new()
                .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
                .author(local_pubkey)
                .since(since),
        ];

        let relays_queried = pool.open_relays().await.len();
        if relays_queried == 0 {
            warn!("Cannot sync missed messages: no relays open");
            return MissedEvents::default();
        }

        let fetched = pool.fetch_events(filters, self.config.sync_timeout).await;
        let total = fetched.len();
        let state = self.state.lock().await;
        let events: Vec<Event> = fetched
            .into_iter()
            .filter(|event| !state.entries.contains_key(event.id()))
            .collect();

        debug!(
            "Sync since {} fetched {} event(s), {} new",
            since,
            total,
            events.len()
        );
        MissedEvents {
            relays_queried,
            fetched: total,
            duplicates: total - events.len(),
            events,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.entries.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.state
            .lock()
            .await
            .entries
            .get(id)
            .map(|entry| entry.message.clone())
    }

    pub async fn get_entry(&self, id: &str) -> Option<StoredMessage> {
        self.state.lock().await.entries.get(id).cloned()
    }

    /// All messages, oldest first
    pub async fn messages(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        ordered_messages(state.entries.values())
    }

    pub async fn messages_by_conversation(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let state = self.state.lock().await;
        ordered_messages(
            state
                .entries
                .values()
                .filter(|entry| &entry.message.conversation_id == conversation_id),
        )
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.entries.len(),
            ..Default::default()
        };
        for entry in state.entries.values() {
            match entry.message.status {
                MessageStatus::Sending => stats.sending += 1,
                MessageStatus::Accepted => stats.accepted += 1,
                MessageStatus::Rejected => stats.rejected += 1,
                MessageStatus::Queued => stats.queued += 1,
                MessageStatus::Delivered => stats.delivered += 1,
            }
        }
        stats
    }
}

fn ordered_messages<'a>(entries: impl Iterator<Item = &'a StoredMessage>) -> Vec<Message> {
    let mut entries: Vec<&StoredMessage> = entries.collect();
    entries.sort_by_key(|entry| (entry.message.timestamp, entry.sequence));
    entries.into_iter().map(|entry| entry.message.clone()).collect()
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::RelayPublishStatus;
    use crate::store::MemoryMessageStore;
    use relaydm_core::{EventBuilder, Keys};

    fn outgoing(sender: &Keys, receiver: &Keys, text: &str) -> (Message, Event) {
        let event = EventBuilder::encrypted_direct_msg(sender, &receiver.public_key_hex(), text)
            .unwrap()
            .to_event(sender)
            .unwrap();
        let message = Message::outgoing(&event, &receiver.public_key_hex(), text, MessageStatus::Sending);
        (message, event)
    }

    fn result(success: bool, rejected: bool) -> PublishResult {
        PublishResult {
            success,
            success_count: usize::from(success),
            total_relays: 1,
            per_relay: vec![RelayPublishStatus {
                relay_url: "ws://a".into(),
                success,
                rejected,
                error: (!success).then(|| "blocked".to_string()),
            }],
        }
    }

    fn queue_with(store: Arc<MemoryMessageStore>) -> MessageQueue {
        MessageQueue::new(store, QueueConfig::testing())
    }

    #[tokio::test]
    async fn test_send_lifecycle_persists_each_transition() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = queue_with(store.clone());
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let (message, event) = outgoing(&alice, &bob, "hi");
        let id = message.id.clone();

        queue.begin_outgoing(message, event).await.unwrap();
        assert_eq!(store.snapshot().await[0].message.status, MessageStatus::Sending);

        let done = queue.complete_send(&id, &result(true, false)).await.unwrap();
        assert_eq!(done.status, MessageStatus::Accepted);
        assert_eq!(store.snapshot().await[0].message.status, MessageStatus::Accepted);

        // Accepted is final
        assert!(matches!(
            queue.claim_for_send(&id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.complete_send(&id, &result(true, false)).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_prevents_concurrent_send() {
        let queue = queue_with(Arc::new(MemoryMessageStore::new()));
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let (message, event) = outgoing(&alice, &bob, "hi");
        let id = message.id.clone();

        queue.queue_outgoing_message(message, event).await.unwrap();
        queue.claim_for_send(&id).await.unwrap();
        assert!(matches!(
            queue.claim_for_send(&id).await,
            Err(EngineError::AlreadyInFlight { .. })
        ));

        let rejected = queue.complete_send(&id, &result(false, true)).await.unwrap();
        assert_eq!(rejected.status, MessageStatus::Rejected);
        assert!(queue.claim_for_send(&id).await.is_ok());
        assert_eq!(queue.get_entry(&id).await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_memory_unchanged() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = queue_with(store.clone());
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let (message, event) = outgoing(&alice, &bob, "hi");
        let id = message.id.clone();
        queue.queue_outgoing_message(message, event).await.unwrap();

        store.set_fail_writes(true);
        assert!(matches!(
            queue.claim_for_send(&id).await,
            Err(EngineError::Persistence(_))
        ));
        assert_eq!(queue.get(&id).await.unwrap().status, MessageStatus::Queued);

        // No claim was left behind
        store.set_fail_writes(false);
        assert!(queue.claim_for_send(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_recovers_interrupted_sends() {
        let store = Arc::new(MemoryMessageStore::new());
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let (message, event) = outgoing(&alice, &bob, "hi");
        let id = message.id.clone();
        {
            let queue = queue_with(store.clone());
            queue.begin_outgoing(message, event).await.unwrap();
        }

        let queue = queue_with(store.clone());
        assert_eq!(queue.load().await.unwrap(), 1);
        assert_eq!(queue.get(&id).await.unwrap().status, MessageStatus::Queued);
        assert_eq!(store.snapshot().await[0].message.status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn test_incoming_messages_are_deduplicated() {
        let queue = queue_with(Arc::new(MemoryMessageStore::new()));
        let (alice, bob) = (Keys::generate(), Keys::generate());
        let (_, event) = outgoing(&alice, &bob, "hi");
        let message = Message::incoming(&event, &bob.public_key_hex(), "hi".into());

        assert!(queue.record_incoming(message.clone()).await.unwrap());
        assert!(!queue.record_incoming(message.clone()).await.unwrap());

        let conversation = ConversationId::new(&alice.public_key_hex(), &bob.public_key_hex());
        let messages = queue.messages_by_conversation(&conversation).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Delivered);

        // Received messages are never re-sent
        assert!(matches!(
            queue.claim_for_send(&message.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(queue.stats().await.delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let queue = queue_with(Arc::new(MemoryMessageStore::new()));
        assert!(matches!(
            queue.claim_for_send("missing").await,
            Err(EngineError::MessageNotFound { .. })
        ));
    }
}
