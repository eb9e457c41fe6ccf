//! Mock relay network
//!
//! A set of [`MockRelay`]s addressed by URL, usable anywhere a
//! [`RelayTransport`] is expected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relaydm_nostr::{PoolConfig, RelayTransport, TransportError, TransportLink};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::relay::MockRelay;

/// URL key used to look relays up; `Url` appends a trailing slash
fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_ascii_lowercase()
}

/// In-process relays reachable through [`RelayTransport::open`]
#[derive(Debug, Default)]
pub struct MockRelayNetwork {
    relays: RwLock<HashMap<String, Arc<MockRelay>>>,
}

impl MockRelayNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or return the existing) relay at `url`
    pub async fn add_relay(&self, url: &str) -> Arc<MockRelay> {
        let mut relays = self.relays.write().await;
        Arc::clone(
            relays
                .entry(normalize(url))
                .or_insert_with(|| MockRelay::new(url)),
        )
    }

    pub async fn relay(&self, url: &str) -> Option<Arc<MockRelay>> {
        self.relays.read().await.get(&normalize(url)).cloned()
    }

    pub async fn relays(&self) -> Vec<Arc<MockRelay>> {
        let mut relays: Vec<Arc<MockRelay>> = self.relays.read().await.values().cloned().collect();
        relays.sort_by(|a, b| a.url().cmp(b.url()));
        relays
    }

    /// Test pool configuration listing every relay on the network
    pub async fn pool_config(&self) -> PoolConfig {
        let urls: Vec<String> = self
            .relays()
            .await
            .iter()
            .map(|relay| relay.url().to_string())
            .collect();
        PoolConfig {
            relays: PoolConfig::with_relays(urls).relays,
            ..PoolConfig::testing()
        }
    }
}

#[async_trait]
impl RelayTransport for MockRelayNetwork {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let relay = self.relay(url.as_str()).await;
        let relay = match relay {
            Some(relay) if !relay.refuses_connections() => relay,
            Some(_) => {
                return Err(TransportError::ConnectionRefused {
                    relay: url.to_string(),
                    reason: "relay refused the connection".to_string(),
                })
            }
            None => {
                return Err(TransportError::ConnectionRefused {
                    relay: url.to_string(),
                    reason: "no such relay".to_string(),
                })
            }
        };

        debug!("Mock network opening {}", relay.url());
        Ok(relay.accept().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::AckMode;
    use relaydm_core::{ClientMessage, EventBuilder, Filter, Keys, RelayMessage, SubscriptionId};
    use relaydm_nostr::TransportEvent;

    async fn next_message(link: &mut TransportLink) -> RelayMessage {
        match link.incoming.recv().await {
            Some(TransportEvent::Frame(frame)) => RelayMessage::from_json(&frame).unwrap(),
            other => panic!("unexpected transport event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_refusing_relays() {
        let network = MockRelayNetwork::new();
        let url = Url::parse("ws://missing.test").unwrap();
        assert!(network.open(&url).await.is_err());

        let relay = network.add_relay("ws://refuse.test").await;
        relay.set_refuse_connections(true);
        let url = Url::parse("ws://refuse.test").unwrap();
        assert!(matches!(
            network.open(&url).await,
            Err(TransportError::ConnectionRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_ack_and_replay() {
        let network = MockRelayNetwork::new();
        let relay = network.add_relay("ws://a.test").await;
        let mut link = network.open(&Url::parse("ws://a.test").unwrap()).await.unwrap();

        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello").to_event(&keys).unwrap();
        link.outgoing
            .send(ClientMessage::event(event.clone()).as_json().unwrap())
            .unwrap();
        assert_eq!(
            next_message(&mut link).await,
            RelayMessage::ok(event.id(), true, "")
        );

        let id = SubscriptionId::new("sub");
        let request = ClientMessage::req(id.clone(), vec![Filter::new().author(keys.public_key_hex())]);
        link.outgoing.send(request.as_json().unwrap()).unwrap();
        assert_eq!(
            next_message(&mut link).await,
            RelayMessage::event(id.clone(), event.clone())
        );
        assert_eq!(next_message(&mut link).await, RelayMessage::eose(id));
        assert_eq!(relay.publish_count(event.id()).await, 1);
    }

    #[tokio::test]
    async fn test_reject_mode_does_not_store() {
        let network = MockRelayNetwork::new();
        let relay = network.add_relay("ws://a.test").await;
        relay.set_ack_mode(AckMode::Reject("blocked: spam".into())).await;
        let mut link = network.open(&Url::parse("ws://a.test/").unwrap()).await.unwrap();

        let event = EventBuilder::text_note("hi").to_event(&Keys::generate()).unwrap();
        link.outgoing
            .send(ClientMessage::event(event.clone()).as_json().unwrap())
            .unwrap();
        assert_eq!(
            next_message(&mut link).await,
            RelayMessage::ok(event.id(), false, "blocked: spam")
        );
        assert!(relay.stored_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_sender_closes_session() {
        let network = MockRelayNetwork::new();
        let relay = network.add_relay("ws://a.test").await;
        let TransportLink { outgoing, mut incoming } =
            network.open(&Url::parse("ws://a.test").unwrap()).await.unwrap();
        assert_eq!(relay.connection_count().await, 1);

        drop(outgoing);
        assert_eq!(incoming.recv().await, Some(TransportEvent::Closed));
        assert_eq!(relay.connection_count().await, 0);
    }
}
