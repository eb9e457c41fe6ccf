//! Relay pool
//!
//! Aggregates connections to N relays. Publishing scatters an event to every
//! open, writable connection and gathers the `OK` replies under a per-relay
//! timeout; a publish succeeds when at least one relay accepts. Subscriptions
//! send one `REQ` per open connection and merge the replies into a single
//! deduplicated stream.
//!
//! Connections report frames on one channel consumed by a router task. The
//! router verifies incoming events, resolves pending acknowledgements and
//! tracks end-of-stored-events per subscription.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use relaydm_core::filter::matches_any;
use relaydm_core::{ClientMessage, Event, Filter, MessageStatus, RelayMessage, SubscriptionId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionStatus, RelayConnection, RelayEvent, RelayEventKind};
use crate::dedup::SeenIds;
use crate::error::{Result, TransportError};
use crate::relay_manager::{PublishOutcome, RelayHealth, RelayManager, RelayManagerStats};
use crate::transport::{parse_relay_url, RelayTransport};

const NOTIFICATION_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Results and Notifications
// ----------------------------------------------------------------------------

/// Outcome of publishing to one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPublishStatus {
    pub relay_url: String,
    pub success: bool,
    /// The relay answered `OK` with `accepted = false`
    pub rejected: bool,
    pub error: Option<String>,
}

/// Aggregate outcome of [`RelayPool::publish_to_all`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// At least one relay accepted the event
    pub success: bool,
    pub success_count: usize,
    pub total_relays: usize,
    pub per_relay: Vec<RelayPublishStatus>,
}

impl PublishResult {
    fn from_statuses(per_relay: Vec<RelayPublishStatus>) -> Self {
        let success_count = per_relay.iter().filter(|status| status.success).count();
        Self {
            success: success_count > 0,
            success_count,
            total_relays: per_relay.len(),
            per_relay,
        }
    }

    /// Delivery status a message should take after this publish
    pub fn disposition(&self) -> MessageStatus {
        if self.success_count > 0 {
            MessageStatus::Accepted
        } else if self.per_relay.iter().any(|status| status.rejected) {
            MessageStatus::Rejected
        } else {
            MessageStatus::Queued
        }
    }

    /// First relay-supplied reason, for surfacing to callers
    pub fn first_error(&self) -> Option<String> {
        if self.total_relays == 0 {
            return Some("no relays connected".to_string());
        }
        self.per_relay
            .iter()
            .find_map(|status| status.error.as_ref())
            .map(|error| error.to_string())
    }
}

/// Pool-level events for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolNotification {
    RelayConnected {
        relay_url: String,
    },
    RelayDisconnected {
        relay_url: String,
        status: ConnectionStatus,
        reason: Option<String>,
    },
    Notice {
        relay_url: String,
        message: String,
    },
}

/// Per-relay entry of [`NetworkState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    pub url: String,
    pub status: ConnectionStatus,
    pub health: RelayHealth,
    pub read_only: bool,
}

/// Snapshot of the pool's connectivity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected_relays: usize,
    pub total_relays: usize,
    pub relays: Vec<RelayState>,
}

impl NetworkState {
    pub fn is_online(&self) -> bool {
        self.connected_relays > 0
    }
}

// ----------------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------------

/// Item yielded by a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    /// A verified, filter-matching event, once per id
    Event(Event),
    /// Every relay targeted so far finished replaying stored events
    EndOfStoredEvents,
}

/// Handle to one logical subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<SubscriptionItem>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Next item; `None` once the pool drops the subscription
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        self.receiver.recv().await
    }

    /// Next event, skipping end-of-stored-events markers
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await? {
                SubscriptionItem::Event(event) => return Some(event),
                SubscriptionItem::EndOfStoredEvents => continue,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionItem> {
        self.receiver.try_recv().ok()
    }
}

struct SubscriptionRoute {
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<SubscriptionItem>,
    seen: SeenIds,
    /// Relays that have not yet sent EOSE or CLOSED
    awaiting_eose: HashSet<String>,
    eose_sent: bool,
}

impl SubscriptionRoute {
    fn relay_finished(&mut self, relay_url: &str) {
        self.awaiting_eose.remove(relay_url);
        if self.awaiting_eose.is_empty() && !self.eose_sent {
            self.eose_sent = true;
            let _ = self.sender.send(SubscriptionItem::EndOfStoredEvents);
        }
    }
}

#[derive(Debug)]
struct AckReply {
    accepted: bool,
    message: String,
}

// ----------------------------------------------------------------------------
// Relay Pool
// ----------------------------------------------------------------------------

/// Pool of relay connections
pub struct RelayPool {
    config: PoolConfig,
    transport: Arc<dyn RelayTransport>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    manager: Mutex<RelayManager>,
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionRoute>>,
    pending_acks: Mutex<HashMap<(String, String), oneshot::Sender<AckReply>>>,
    notifications: broadcast::Sender<PoolNotification>,
}

impl RelayPool {
    /// Create a pool over `transport`. Must be called within a tokio runtime.
    pub fn new(config: PoolConfig, transport: Arc<dyn RelayTransport>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let manager = RelayManager::from_config(&config);

        let pool = Arc::new(Self {
            config,
            transport,
            events_tx,
            connections: RwLock::new(HashMap::new()),
            manager: Mutex::new(manager),
            subscriptions: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            notifications,
        });

        tokio::spawn(Self::route_events(Arc::downgrade(&pool), events_rx));
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Observe connection changes and relay notices
    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.notifications.subscribe()
    }

    // ------------------------------------------------------------------------
    // Relay set
    // ------------------------------------------------------------------------

    /// Register a relay; returns false if it was already known
    pub async fn add_relay(&self, url: &str, read_only: bool) -> Result<bool> {
        parse_relay_url(url)?;
        Ok(self.manager.lock().await.add_relay(url, read_only))
    }

    /// Forget a relay, closing its connection if open
    pub async fn remove_relay(&self, url: &str) -> bool {
        let known = self.manager.lock().await.remove_relay(url).is_some();
        let connection = self.connections.write().await.remove(url);
        if let Some(connection) = connection {
            connection.close().await;
            self.forget_relay_state(url).await;
        }
        known
    }

    /// URLs of currently open connections
    pub async fn open_relays(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut urls: Vec<String> = connections
            .values()
            .filter(|connection| connection.is_open())
            .map(|connection| connection.url().to_string())
            .collect();
        urls.sort();
        urls
    }

    async fn open_connections(&self) -> Vec<Arc<RelayConnection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.is_open())
            .cloned()
            .collect()
    }

    pub async fn relay_stats(&self) -> RelayManagerStats {
        self.manager.lock().await.get_stats()
    }

    pub async fn network_state(&self) -> NetworkState {
        let statuses: HashMap<String, ConnectionStatus> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(url, connection)| (url.clone(), connection.status()))
            .collect();
        let manager = self.manager.lock().await;

        let relays: Vec<RelayState> = manager
            .relays()
            .iter()
            .map(|info| RelayState {
                url: info.url.clone(),
                status: statuses
                    .get(&info.url)
                    .copied()
                    .unwrap_or(ConnectionStatus::Disconnected),
                health: info.health,
                read_only: info.read_only,
            })
            .collect();

        NetworkState {
            connected_relays: relays
                .iter()
                .filter(|relay| relay.status == ConnectionStatus::Open)
                .count(),
            total_relays: relays.len(),
            relays,
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    /// Connect to known relays, healthiest first, up to `max_connections`.
    ///
    /// Returns the number of open connections afterwards.
    pub async fn connect(&self) -> usize {
        let candidates = self.manager.lock().await.preferred_candidates();
        self.connect_candidates(candidates).await
    }

    /// Retry disconnected relays whose backoff has elapsed
    pub async fn reconnect_due(&self) -> usize {
        let due = self.manager.lock().await.due_for_reconnect(Instant::now());
        if due.is_empty() {
            return self.open_relays().await.len();
        }
        debug!("Reconnecting {} relay(s)", due.len());
        self.connect_candidates(due).await
    }

    async fn connect_candidates(&self, mut candidates: Vec<String>) -> usize {
        if let Some(max) = self.config.max_connections {
            let open = self.open_relays().await.len();
            candidates.truncate(max.saturating_sub(open));
        }

        let attempts = candidates.iter().map(|url| self.connect_relay(url));
        for result in join_all(attempts).await {
            if let Err(e) = result {
                debug!("Connection attempt failed: {}", e);
            }
        }
        self.open_relays().await.len()
    }

    /// Open a connection to one relay, registering it if unknown
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        parse_relay_url(url)?;
        self.manager.lock().await.add_relay(url, false);

        let connection = {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(url) {
                if !existing.status().is_terminal() {
                    return Ok(());
                }
            }
            let connection = RelayConnection::new(url, self.config.max_protocol_violations);
            connections.insert(url.to_string(), Arc::clone(&connection));
            connection
        };

        self.manager
            .lock()
            .await
            .record_connection_attempt(url, Instant::now());

        let result = connection
            .connect(
                self.transport.as_ref(),
                self.events_tx.clone(),
                self.config.connection_timeout,
            )
            .await;

        match result {
            Ok(()) => {
                self.manager
                    .lock()
                    .await
                    .record_connection_result(url, true, Instant::now());
                info!("Connected to relay {}", url);
                self.replay_subscriptions(&connection).await;
                let _ = self.notifications.send(PoolNotification::RelayConnected {
                    relay_url: url.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                {
                    let mut connections = self.connections.write().await;
                    if connections
                        .get(url)
                        .is_some_and(|current| Arc::ptr_eq(current, &connection))
                    {
                        connections.remove(url);
                    }
                }
                self.manager
                    .lock()
                    .await
                    .record_connection_result(url, false, Instant::now());
                warn!("Failed to connect to relay {}: {}", url, e);
                Err(e.into())
            }
        }
    }

    /// Re-send every active subscription to a newly opened connection
    async fn replay_subscriptions(&self, connection: &Arc<RelayConnection>) {
        let requests: Vec<ClientMessage> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter_mut()
                .map(|(id, route)| {
                    if !route.eose_sent {
                        route.awaiting_eose.insert(connection.url().to_string());
                    }
                    ClientMessage::req(id.clone(), route.filters.clone())
                })
                .collect()
        };

        for request in requests {
            if let Err(e) = connection.send(&request).await {
                warn!("Failed to replay subscription to {}: {}", connection.url(), e);
            }
        }
    }

    /// Close every connection. Relays stay registered and can reconnect.
    pub async fn disconnect(&self) {
        let connections: Vec<Arc<RelayConnection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();

        join_all(connections.iter().map(|connection| connection.close())).await;

        let now = Instant::now();
        for connection in &connections {
            self.manager
                .lock()
                .await
                .record_disconnect(connection.url(), false, now);
            self.forget_relay_state(connection.url()).await;
        }
        info!("Disconnected from {} relay(s)", connections.len());
    }

    /// Spawn a task that periodically reconnects due relays.
    ///
    /// The task ends once the pool is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.config.reconnect_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.reconnect_due().await;
            }
        })
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Send `event` to every open, writable relay and gather acknowledgements.
    ///
    /// Each relay gets `ack_timeout` to answer; a silent or failing relay only
    /// affects its own entry in the result.
    pub async fn publish_to_all(&self, event: &Event) -> PublishResult {
        let open = self.open_connections().await;
        let targets: Vec<Arc<RelayConnection>> = {
            let manager = self.manager.lock().await;
            open.into_iter()
                .filter(|connection| !manager.is_read_only(connection.url()))
                .collect()
        };

        if targets.is_empty() {
            debug!("No writable relays open for event {}", event.id());
            return PublishResult::from_statuses(Vec::new());
        }

        let frame = match ClientMessage::event(event.clone()).as_json() {
            Ok(frame) => frame,
            Err(e) => {
                let statuses = targets
                    .iter()
                    .map(|connection| RelayPublishStatus {
                        relay_url: connection.url().to_string(),
                        success: false,
                        rejected: false,
                        error: Some(e.to_string()),
                    })
                    .collect();
                return PublishResult::from_statuses(statuses);
            }
        };

        let sends = targets
            .iter()
            .map(|connection| self.publish_one(connection, frame.clone(), event.id()));
        let result = PublishResult::from_statuses(join_all(sends).await);

        debug!(
            "Event {} accepted by {}/{} relays",
            event.id(),
            result.success_count,
            result.total_relays
        );
        result
    }

    async fn publish_one(
        &self,
        connection: &Arc<RelayConnection>,
        frame: String,
        event_id: &str,
    ) -> RelayPublishStatus {
        let relay_url = connection.url().to_string();
        let key = (relay_url.clone(), event_id.to_string());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(key.clone(), ack_tx);

        let started = Instant::now();
        if let Err(e) = connection.send_raw(frame).await {
            self.pending_acks.lock().await.remove(&key);
            self.record_publish(&relay_url, PublishOutcome::Failed).await;
            return RelayPublishStatus {
                relay_url,
                success: false,
                rejected: false,
                error: Some(e.to_string()),
            };
        }

        let ack_timeout = self.config.ack_timeout;
        let (outcome, status) = match tokio::time::timeout(ack_timeout, ack_rx).await {
            Ok(Ok(reply)) if reply.accepted => (
                PublishOutcome::Accepted {
                    latency: started.elapsed(),
                },
                RelayPublishStatus {
                    relay_url: relay_url.clone(),
                    success: true,
                    rejected: false,
                    error: None,
                },
            ),
            Ok(Ok(reply)) => (
                PublishOutcome::Rejected,
                RelayPublishStatus {
                    relay_url: relay_url.clone(),
                    success: false,
                    rejected: true,
                    error: Some(if reply.message.is_empty() {
                        "rejected".to_string()
                    } else {
                        reply.message
                    }),
                },
            ),
            Ok(Err(_)) => (
                PublishOutcome::Failed,
                RelayPublishStatus {
                    relay_url: relay_url.clone(),
                    success: false,
                    rejected: false,
                    error: Some(
                        TransportError::Closed {
                            relay: relay_url.clone(),
                        }
                        .to_string(),
                    ),
                },
            ),
            Err(_) => {
                self.pending_acks.lock().await.remove(&key);
                warn!("Relay {} did not acknowledge {} in time", relay_url, event_id);
                (
                    PublishOutcome::Failed,
                    RelayPublishStatus {
                        relay_url: relay_url.clone(),
                        success: false,
                        rejected: false,
                        error: Some(
                            TransportError::Timeout {
                                relay: relay_url.clone(),
                                after_ms: ack_timeout.as_millis() as u64,
                            }
                            .to_string(),
                        ),
                    },
                )
            }
        };

        self.record_publish(&relay_url, outcome).await;
        status
    }

    async fn record_publish(&self, relay_url: &str, outcome: PublishOutcome) {
        self.manager.lock().await.record_publish(relay_url, outcome);
    }

    // ------------------------------------------------------------------------
    // Subscribing
    // ------------------------------------------------------------------------

    /// Register one logical subscription across every open connection
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
        let id = SubscriptionId::generate();
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut route = SubscriptionRoute {
                filters: filters.clone(),
                sender,
                seen: SeenIds::new(self.config.dedup_capacity),
                awaiting_eose: self
                    .open_connections()
                    .await
                    .iter()
                    .map(|connection| connection.url().to_string())
                    .collect(),
                eose_sent: false,
            };
            if route.awaiting_eose.is_empty() {
                route.eose_sent = true;
                let _ = route.sender.send(SubscriptionItem::EndOfStoredEvents);
            }
            self.subscriptions.lock().await.insert(id.clone(), route);
        }

        // Read again after inserting the route: a relay that opened in between
        // may have replayed before the route existed. Repeating a REQ is harmless.
        let connections = self.open_connections().await;
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(route) = subscriptions.get_mut(&id) {
                if !route.eose_sent {
                    route
                        .awaiting_eose
                        .extend(connections.iter().map(|c| c.url().to_string()));
                }
            }
        }

        let request = ClientMessage::req(id.clone(), filters);
        let sends = connections.iter().map(|connection| connection.send(&request));
        let results = join_all(sends).await;

        let failed: Vec<&str> = connections
            .iter()
            .zip(results)
            .filter_map(|(connection, result)| result.err().map(|_| connection.url()))
            .collect();
        if !failed.is_empty() {
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(route) = subscriptions.get_mut(&id) {
                for url in failed {
                    warn!("Failed to send subscription {} to {}", id, url);
                    route.relay_finished(url);
                }
            }
        }

        debug!("Subscription {} sent to {} relay(s)", id, connections.len());
        Subscription { id, receiver }
    }

    /// Drop local routing and send `CLOSE` to every open relay.
    ///
    /// Best-effort: a relay may already have an event in flight.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let existed = self.subscriptions.lock().await.remove(id).is_some();
        if existed {
            self.send_close(id).await;
        }
        existed
    }

    async fn send_close(&self, id: &SubscriptionId) {
        let close = ClientMessage::close(id.clone());
        let connections = self.open_connections().await;
        for result in join_all(connections.iter().map(|c| c.send(&close))).await {
            if let Err(e) = result {
                debug!("CLOSE for {} not delivered: {}", id, e);
            }
        }
    }

    /// Collect stored events matching `filters` until every relay sends EOSE
    /// or `timeout` elapses
    pub async fn fetch_events(&self, filters: Vec<Filter>, timeout: Duration) -> Vec<Event> {
        let mut subscription = self.subscribe(filters).await;
        let mut events = Vec::new();

        let collect = async {
            while let Some(item) = subscription.recv().await {
                match item {
                    SubscriptionItem::Event(event) => events.push(event),
                    SubscriptionItem::EndOfStoredEvents => break,
                }
            }
        };
        if tokio::time::timeout(timeout, collect).await.is_err() {
            debug!("Fetch {} timed out with {} event(s)", subscription.id(), events.len());
        }

        self.unsubscribe(subscription.id()).await;
        events
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    async fn route_events(pool: Weak<RelayPool>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.handle_relay_event(event).await;
        }
        debug!("Relay pool router stopped");
    }

    async fn handle_relay_event(&self, event: RelayEvent) {
        let RelayEvent { relay_url, kind } = event;
        match kind {
            RelayEventKind::Message(message) => self.handle_message(&relay_url, message).await,
            RelayEventKind::Disconnected { status, reason } => {
                self.handle_disconnect(&relay_url, status, reason).await
            }
        }
    }

    async fn handle_message(&self, relay_url: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.route_event(relay_url, &subscription_id, *event).await,
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let pending = self
                    .pending_acks
                    .lock()
                    .await
                    .remove(&(relay_url.to_string(), event_id.clone()));
                match pending {
                    Some(ack) => {
                        let _ = ack.send(AckReply { accepted, message });
                    }
                    None => debug!("Unsolicited OK for {} from {}", event_id, relay_url),
                }
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                if let Some(route) = self.subscriptions.lock().await.get_mut(&subscription_id) {
                    route.relay_finished(relay_url);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!(
                    "Relay {} closed subscription {}: {}",
                    relay_url, subscription_id, message
                );
                if let Some(route) = self.subscriptions.lock().await.get_mut(&subscription_id) {
                    route.relay_finished(relay_url);
                }
            }
            RelayMessage::Notice(message) => {
                info!("Notice from {}: {}", relay_url, message);
                let _ = self.notifications.send(PoolNotification::Notice {
                    relay_url: relay_url.to_string(),
                    message,
                });
            }
        }
    }

    async fn route_event(&self, relay_url: &str, subscription_id: &SubscriptionId, event: Event) {
        let receiver_gone = {
            let mut subscriptions = self.subscriptions.lock().await;
            let Some(route) = subscriptions.get_mut(subscription_id) else {
                debug!(
                    "Event {} from {} for inactive subscription {}",
                    event.id(),
                    relay_url,
                    subscription_id
                );
                return;
            };

            if route.seen.contains(event.id()) {
                return;
            }
            if let Err(e) = event.verify() {
                warn!("Dropping invalid event {} from {}: {}", event.id(), relay_url, e);
                return;
            }
            if !matches_any(&route.filters, &event) {
                debug!(
                    "Dropping event {} from {} outside subscription {}",
                    event.id(),
                    relay_url,
                    subscription_id
                );
                return;
            }

            route.seen.insert(event.id());
            let gone = route.sender.send(SubscriptionItem::Event(event)).is_err();
            if gone {
                subscriptions.remove(subscription_id);
            }
            gone
        };

        if receiver_gone {
            debug!("Subscription {} dropped by its owner", subscription_id);
            self.send_close(subscription_id).await;
        }
    }

    async fn handle_disconnect(
        &self,
        relay_url: &str,
        status: ConnectionStatus,
        reason: Option<String>,
    ) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(relay_url) {
                Some(current) if current.status().is_terminal() => {
                    connections.remove(relay_url);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }

        self.manager.lock().await.record_disconnect(
            relay_url,
            status == ConnectionStatus::Error,
            Instant::now(),
        );
        self.forget_relay_state(relay_url).await;

        let _ = self.notifications.send(PoolNotification::RelayDisconnected {
            relay_url: relay_url.to_string(),
            status,
            reason,
        });
    }

    /// Fail pending acknowledgements and stop waiting for EOSE from `relay_url`
    async fn forget_relay_state(&self, relay_url: &str) {
        self.pending_acks
            .lock()
            .await
            .retain(|(url, _), _| url != relay_url);

        for route in self.subscriptions.lock().await.values_mut() {
            route.relay_finished(relay_url);
        }
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.config.relays.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
