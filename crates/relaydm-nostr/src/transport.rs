//! Relay transports
//!
//! A transport opens a bidirectional text channel to a relay URL and hands
//! back a [`TransportLink`]: frames pushed into `outgoing` are written to the
//! relay, frames and lifecycle events from the relay arrive on `incoming`.
//! Dropping the `outgoing` sender asks the transport to close the channel; the
//! transport answers with [`TransportEvent::Closed`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

// ----------------------------------------------------------------------------
// Transport Link
// ----------------------------------------------------------------------------

/// Lifecycle and data events reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the relay
    Frame(String),
    /// The channel closed cleanly
    Closed,
    /// The channel failed; no further events follow
    Error(String),
}

/// An open channel to one relay
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens channels to relays
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

/// Parse and check a relay URL
pub fn parse_relay_url(url: &str) -> Result<Url, TransportError> {
    let parsed = Url::parse(url).map_err(|_| TransportError::InvalidUrl {
        url: url.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        _ => Err(TransportError::InvalidUrl {
            url: url.to_string(),
        }),
    }
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

/// Transport over WebSockets using tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let (stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionRefused {
                    relay: url.to_string(),
                    reason: e.to_string(),
                })?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let relay = url.to_string();

        tokio::spawn(async move {
            let (mut sink, mut source) = stream.split();

            loop {
                tokio::select! {
                    frame = outgoing_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                warn!("WebSocket send to {} failed: {}", relay, e);
                                let _ = incoming_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        None => {
                            debug!("Closing WebSocket to {}", relay);
                            let _ = sink.send(WsMessage::Close(None)).await;
                            let _ = incoming_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                    message = source.next() => match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if incoming_tx.send(TransportEvent::Frame(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            // Binary frames are accepted when they hold UTF-8
                            match String::from_utf8(bytes) {
                                Ok(text) => {
                                    let _ = incoming_tx.send(TransportEvent::Frame(text));
                                }
                                Err(_) => debug!("Dropping non-UTF-8 binary frame from {}", relay),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = incoming_tx.send(TransportEvent::Closed);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error from {}: {}", relay, e);
                            let _ = incoming_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    },
                }
            }
        });

        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
