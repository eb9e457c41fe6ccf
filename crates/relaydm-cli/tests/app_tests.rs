//! Application wiring against in-process relays

use std::sync::Arc;
use std::time::Duration;

use relaydm_cli::{AppConfig, CliError, RelaydmApp};
use relaydm_core::{Keys, MessageStatus};
use relaydm_harness::MockRelayNetwork;
use relaydm_nostr::{DmNotification, MemoryMessageStore, SECRET_KEY_ENV};
use tokio::time::timeout;

fn config_for(keys: &Keys, relays: &[&str]) -> AppConfig {
    let mut config = AppConfig {
        secret_key: Some(keys.secret_key_hex()),
        ..AppConfig::default()
    };
    config.override_relays(&relays.iter().map(|url| url.to_string()).collect::<Vec<_>>());
    config
}

async fn app_on(network: &Arc<MockRelayNetwork>, config: AppConfig) -> RelaydmApp {
    RelaydmApp::with_parts(config, network.clone(), Arc::new(MemoryMessageStore::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_message_between_two_clients() {
    let network = MockRelayNetwork::new();
    network.add_relay("ws://a.test").await;
    network.add_relay("ws://b.test").await;
    let relays = ["ws://a.test", "ws://b.test"];

    let alice_keys = Keys::generate();
    let bob_keys = Keys::generate();
    let mut alice = app_on(&network, config_for(&alice_keys, &relays)).await;
    let mut bob = app_on(&network, config_for(&bob_keys, &relays)).await;
    assert_eq!(alice.start().await.unwrap(), 2);
    assert_eq!(bob.start().await.unwrap(), 2);

    let mut notifications = bob.controller().notifications();
    bob.controller().subscribe_to_incoming_dms().await.unwrap();

    let result = alice
        .controller()
        .send_dm(&bob_keys.public_key_hex(), "hello bob")
        .await;
    assert!(result.success);
    assert_eq!(result.status, Some(MessageStatus::Accepted));

    let received = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(DmNotification::MessageReceived(message)) = notifications.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received.content, "hello bob");
    assert_eq!(received.peer, alice_keys.public_key_hex());

    alice.stop().await;
    bob.stop().await;
    assert_eq!(network.relay("ws://a.test").await.unwrap().connection_count().await, 0);
}

#[tokio::test]
async fn test_blocked_sender_from_config_is_dropped() {
    let network = MockRelayNetwork::new();
    network.add_relay("ws://a.test").await;

    let alice_keys = Keys::generate();
    let bob_keys = Keys::generate();
    let mut bob_config = config_for(&bob_keys, &["ws://a.test"]);
    bob_config.messages.blocked = vec![alice_keys.public_key_hex()];

    let mut alice = app_on(&network, config_for(&alice_keys, &["ws://a.test"])).await;
    let mut bob = app_on(&network, bob_config).await;
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    bob.controller().subscribe_to_incoming_dms().await.unwrap();

    let result = alice
        .controller()
        .send_dm(&bob_keys.public_key_hex(), "let me in")
        .await;
    assert!(result.success);

    timeout(Duration::from_secs(2), async {
        while bob.controller().stats().dropped_untrusted == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(bob.controller().snapshot().await.messages.is_empty());
}

#[tokio::test]
async fn test_unreachable_relays_queue_messages() {
    let network = MockRelayNetwork::new();
    let keys = Keys::generate();
    let mut app = app_on(&network, config_for(&keys, &["ws://down.test"])).await;
    assert_eq!(app.start().await.unwrap(), 0);

    let result = app
        .controller()
        .send_dm(&Keys::generate().public_key_hex(), "later")
        .await;
    assert!(!result.success);
    assert_eq!(result.status, Some(MessageStatus::Queued));
    app.stop().await;
}

#[tokio::test]
async fn test_missing_secret_key_is_reported() {
    std::env::remove_var(SECRET_KEY_ENV);
    let network = MockRelayNetwork::new();

    let outcome = RelaydmApp::with_parts(
        AppConfig::default(),
        network,
        Arc::new(MemoryMessageStore::new()),
    )
    .await;
    assert!(matches!(outcome, Err(CliError::MissingKey(_))));
}
