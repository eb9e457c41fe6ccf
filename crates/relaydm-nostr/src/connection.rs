//! Single-relay connection with an explicit state machine
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Closed
//!       any non-terminal state -> Error   (transport failure)
//! Disconnected | Connecting | Error -> Closed   (close requested)
//! ```
//!
//! `Closed` is terminal. A connection never reconnects itself; the pool
//! builds a fresh connection for every attempt.

use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaydm_core::{ClientMessage, RelayMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::{RelayTransport, TransportEvent, TransportLink};

/// Time `close()` waits for the transport to confirm before forcing `Closed`
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// State of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionStatus {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Error) => self != Error,
            (Disconnected, Connecting)
            | (Connecting, Open)
            | (Open, Closing)
            | (Closing, Closed)
            | (Disconnected, Closed)
            | (Connecting, Closed)
            | (Error, Closed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Closed | ConnectionStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Open => "Open",
            ConnectionStatus::Closing => "Closing",
            ConnectionStatus::Closed => "Closed",
            ConnectionStatus::Error => "Error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Relay Events
// ----------------------------------------------------------------------------

/// Event emitted by a connection to its owner
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub relay_url: String,
    pub kind: RelayEventKind,
}

#[derive(Debug, Clone)]
pub enum RelayEventKind {
    /// A well-formed frame, in arrival order
    Message(RelayMessage),
    /// The connection left `Open` for good
    Disconnected {
        status: ConnectionStatus,
        reason: Option<String>,
    },
}

// ----------------------------------------------------------------------------
// Relay Connection
// ----------------------------------------------------------------------------

/// One connection to one relay
pub struct RelayConnection {
    url: String,
    status: watch::Sender<ConnectionStatus>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last frame in either direction
    last_activity_ms: AtomicU64,
    protocol_violations: AtomicU32,
    max_protocol_violations: u32,
}

impl RelayConnection {
    pub fn new<S: Into<String>>(url: S, max_protocol_violations: u32) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            url: url.into(),
            status,
            outgoing: Mutex::new(None),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            protocol_violations: AtomicU32::new(0),
            max_protocol_violations: max_protocol_violations.max(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Instant of the last frame sent or received
    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn protocol_violations(&self) -> u32 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Apply a transition, rejecting moves the state machine forbids
    fn transition(&self, next: ConnectionStatus) -> Result<ConnectionStatus, TransportError> {
        let mut previous = None;
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(from) => {
                debug!("Relay {}: {} -> {}", self.url, from, next);
                Ok(from)
            }
            None => Err(TransportError::InvalidState {
                relay: self.url.clone(),
                from: self.status(),
                to: next,
            }),
        }
    }

    /// Open the transport and start forwarding frames to `events`.
    ///
    /// Each well-formed frame is delivered as [`RelayEventKind::Message`]; a
    /// final [`RelayEventKind::Disconnected`] follows once the connection
    /// leaves `Open`.
    pub async fn connect(
        self: &Arc<Self>,
        transport: &dyn RelayTransport,
        events: mpsc::UnboundedSender<RelayEvent>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.transition(ConnectionStatus::Connecting)?;

        let url = Url::parse(&self.url).map_err(|_| TransportError::InvalidUrl {
            url: self.url.clone(),
        });
        let opened = match url {
            Ok(url) => match tokio::time::timeout(timeout, transport.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    relay: self.url.clone(),
                    after_ms: timeout.as_millis() as u64,
                }),
            },
            Err(e) => Err(e),
        };

        let TransportLink { outgoing, incoming } = match opened {
            Ok(link) => link,
            Err(e) => {
                let _ = self.transition(ConnectionStatus::Error);
                return Err(e);
            }
        };

        *self.outgoing.lock().await = Some(outgoing);
        if self.transition(ConnectionStatus::Open).is_err() {
            // close() won the race while the transport was opening
            self.outgoing.lock().await.take();
            return Err(TransportError::Closed {
                relay: self.url.clone(),
            });
        }
        self.touch();

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.read_loop(incoming, events).await;
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) {
        let reason = loop {
            match incoming.recv().await {
                Some(TransportEvent::Frame(text)) => {
                    self.touch();
                    match RelayMessage::from_json(&text) {
                        Ok(message) => {
                            let event = RelayEvent {
                                relay_url: self.url.clone(),
                                kind: RelayEventKind::Message(message),
                            };
                            if events.send(event).is_err() {
                                break Some("event receiver dropped".to_string());
                            }
                        }
                        Err(e) => {
                            let violations =
                                self.protocol_violations.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!("Dropping malformed frame from {}: {}", self.url, e);
                            if violations >= self.max_protocol_violations {
                                warn!(
                                    "Relay {} sent {} malformed frames, tearing down",
                                    self.url, violations
                                );
                                break Some(format!("{violations} protocol violations"));
                            }
                        }
                    }
                }
                Some(TransportEvent::Closed) => break None,
                Some(TransportEvent::Error(e)) => break Some(e),
                None => break Some("transport dropped".to_string()),
            }
        };

        self.outgoing.lock().await.take();

        let status = match (self.status(), reason.as_ref()) {
            (ConnectionStatus::Closing, None) => ConnectionStatus::Closed,
            _ => ConnectionStatus::Error,
        };
        let reason = match (status, reason) {
            (ConnectionStatus::Error, None) => Some("closed by relay".to_string()),
            (_, reason) => reason,
        };
        if self.transition(status).is_err() {
            return;
        }
        if status == ConnectionStatus::Error {
            warn!(
                "Relay {} disconnected: {}",
                self.url,
                reason.as_deref().unwrap_or("unknown")
            );
        }

        let _ = events.send(RelayEvent {
            relay_url: self.url.clone(),
            kind: RelayEventKind::Disconnected { status, reason },
        });
    }

    /// Send a raw text frame
    pub async fn send_raw(&self, frame: String) -> Result<(), TransportError> {
        let status = self.status();
        if status != ConnectionStatus::Open {
            return Err(TransportError::SendFailed {
                relay: self.url.clone(),
                reason: format!("connection is {status}"),
            });
        }

        let outgoing = self.outgoing.lock().await;
        let sender = outgoing.as_ref().ok_or_else(|| TransportError::Closed {
            relay: self.url.clone(),
        })?;
        sender.send(frame).map_err(|_| TransportError::Closed {
            relay: self.url.clone(),
        })?;
        self.touch();
        Ok(())
    }

    /// Encode and send a client frame
    pub async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let frame = message
            .as_json()
            .map_err(|e| TransportError::SendFailed {
                relay: self.url.clone(),
                reason: e.to_string(),
            })?;
        self.send_raw(frame).await
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        match self.status() {
            ConnectionStatus::Open => {
                if self.transition(ConnectionStatus::Closing).is_err() {
                    return;
                }
                self.outgoing.lock().await.take();

                let mut status = self.subscribe_status();
                let confirmed = matches!(
                    tokio::time::timeout(CLOSE_GRACE, status.wait_for(|s| s.is_terminal())).await,
                    Ok(Ok(_))
                );
                if !confirmed {
                    debug!("Relay {} did not confirm close, forcing", self.url);
                    let _ = self.transition(ConnectionStatus::Closed);
                }
            }
            ConnectionStatus::Closing | ConnectionStatus::Closed => {}
            _ => {
                self.outgoing.lock().await.take();
                let _ = self.transition(ConnectionStatus::Closed);
            }
        }
    }
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
