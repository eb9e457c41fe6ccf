//! Scriptable in-process relay
//!
//! Speaks the client/relay frame protocol over [`TransportLink`] channels.
//! Tests choose how it acknowledges published events, whether it accepts
//! connections, and can push events or raw frames to connected clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use relaydm_core::filter::matches_any;
use relaydm_core::{ClientMessage, Event, Filter, RelayMessage, SubscriptionId};
use relaydm_nostr::{TransportEvent, TransportLink};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Behaviour
// ----------------------------------------------------------------------------

/// How the relay answers `EVENT` frames
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Store the event and reply `OK true`
    #[default]
    Accept,
    /// Reply `OK false` with the given reason
    Reject(String),
    /// Never reply and never store
    Silent,
}

struct Client {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<SubscriptionId, Vec<Filter>>,
}

impl Client {
    fn send(&self, message: &RelayMessage) {
        if let Ok(frame) = message.as_json() {
            let _ = self.to_client.send(TransportEvent::Frame(frame));
        }
    }

    fn deliver(&self, event: &Event) {
        for (id, filters) in &self.subscriptions {
            if matches_any(filters, event) {
                self.send(&RelayMessage::event(id.clone(), event.clone()));
            }
        }
    }
}

#[derive(Default)]
struct RelayState {
    ack_mode: AckMode,
    stored: Vec<Event>,
    received: Vec<Event>,
    clients: HashMap<u64, Client>,
}

// ----------------------------------------------------------------------------
// Mock Relay
// ----------------------------------------------------------------------------

/// One simulated relay
pub struct MockRelay {
    url: String,
    state: Mutex<RelayState>,
    refuse_connections: AtomicBool,
    next_client: AtomicU64,
    connections_accepted: AtomicU64,
}

impl MockRelay {
    pub(crate) fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            state: Mutex::new(RelayState::default()),
            refuse_connections: AtomicBool::new(false),
            next_client: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().await.ack_mode = mode;
    }

    /// Refuse new connections; existing ones are unaffected
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn refuses_connections(&self) -> bool {
        self.refuse_connections.load(Ordering::SeqCst)
    }

    /// Connections accepted over the relay's lifetime
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::SeqCst)
    }

    /// Clients currently connected
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .await
            .clients
            .values()
            .map(|client| client.subscriptions.len())
            .sum()
    }

    /// Every `EVENT` published to this relay, in arrival order
    pub async fn received_events(&self) -> Vec<Event> {
        self.state.lock().await.received.clone()
    }

    pub async fn stored_events(&self) -> Vec<Event> {
        self.state.lock().await.stored.clone()
    }

    /// Times an event id was published to this relay
    pub async fn publish_count(&self, event_id: &str) -> usize {
        self.state
            .lock()
            .await
            .received
            .iter()
            .filter(|event| event.id() == event_id)
            .count()
    }

    /// Store `event` and push it to matching subscriptions without checks
    pub async fn inject_event(&self, event: Event) {
        let mut state = self.state.lock().await;
        for client in state.clients.values() {
            client.deliver(&event);
        }
        if !state.stored.iter().any(|stored| stored.id() == event.id()) {
            state.stored.push(event);
        }
    }

    /// Push an event to one subscription, ignoring its filters
    pub async fn deliver_to(&self, subscription_id: &SubscriptionId, event: Event) {
        let state = self.state.lock().await;
        for client in state.clients.values() {
            if client.subscriptions.contains_key(subscription_id) {
                client.send(&RelayMessage::event(subscription_id.clone(), event.clone()));
            }
        }
    }

    /// Send a raw text frame to every connected client
    pub async fn send_raw(&self, frame: &str) {
        let state = self.state.lock().await;
        for client in state.clients.values() {
            let _ = client.to_client.send(TransportEvent::Frame(frame.to_string()));
        }
    }

    /// Drop every client as if the relay went away
    pub async fn drop_connections(&self) {
        let clients: Vec<Client> = self.state.lock().await.clients.drain().map(|(_, c)| c).collect();
        debug!("Mock relay {} dropping {} client(s)", self.url, clients.len());
        for client in clients {
            let _ = client
                .to_client
                .send(TransportEvent::Error("connection reset by relay".to_string()));
        }
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Accept a client and start serving its frames
    pub(crate) async fn accept(self: &Arc<Self>) -> TransportLink {
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);

        self.state.lock().await.clients.insert(
            client_id,
            Client {
                to_client,
                subscriptions: HashMap::new(),
            },
        );
        self.connections_accepted.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(Arc::clone(self).serve(client_id, from_client));
        TransportLink { outgoing, incoming }
    }

    async fn serve(self: Arc<Self>, client_id: u64, mut from_client: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = from_client.recv().await {
            self.handle_frame(client_id, &frame).await;
        }

        // The client dropped its sender: acknowledge the close
        if let Some(client) = self.state.lock().await.clients.remove(&client_id) {
            let _ = client.to_client.send(TransportEvent::Closed);
        }
        trace!("Mock relay {} session {} ended", self.url, client_id);
    }

    async fn handle_frame(&self, client_id: u64, frame: &str) {
        let mut state = self.state.lock().await;
        let message = match ClientMessage::from_json(frame) {
            Ok(message) => message,
            Err(e) => {
                if let Some(client) = state.clients.get(&client_id) {
                    client.send(&RelayMessage::notice(format!("invalid: {e}")));
                }
                return;
            }
        };

        match message {
            ClientMessage::Event(event) => {
                let event = *event;
                state.received.push(event.clone());

                let ack_mode = state.ack_mode.clone();
                let reply = match (&ack_mode, event.verify()) {
                    (AckMode::Silent, _) => None,
                    (_, Err(e)) => Some(RelayMessage::ok(event.id(), false, format!("invalid: {e}"))),
                    (AckMode::Reject(reason), Ok(())) => {
                        Some(RelayMessage::ok(event.id(), false, reason.clone()))
                    }
                    (AckMode::Accept, Ok(())) => {
                        if state.stored.iter().any(|stored| stored.id() == event.id()) {
                            Some(RelayMessage::ok(event.id(), true, "duplicate: already have this event"))
                        } else {
                            for client in state.clients.values() {
                                client.deliver(&event);
                            }
                            let ok = RelayMessage::ok(event.id(), true, "");
                            state.stored.push(event);
                            Some(ok)
                        }
                    }
                };

                if let (Some(reply), Some(client)) = (reply, state.clients.get(&client_id)) {
                    client.send(&reply);
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let stored: Vec<Event> = state
                    .stored
                    .iter()
                    .filter(|event| matches_any(&filters, event))
                    .cloned()
                    .collect();
                if let Some(client) = state.clients.get_mut(&client_id) {
                    for event in stored {
                        client.send(&RelayMessage::event(subscription_id.clone(), event));
                    }
                    client.send(&RelayMessage::eose(subscription_id.clone()));
                    client.subscriptions.insert(subscription_id, filters);
                }
            }
            ClientMessage::Close(subscription_id) => {
                if let Some(client) = state.clients.get_mut(&client_id) {
                    client.subscriptions.remove(&subscription_id);
                }
            }
        }
    }
}

impl std::fmt::Debug for MockRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelay")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
