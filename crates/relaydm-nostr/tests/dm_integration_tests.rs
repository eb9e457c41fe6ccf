//! End-to-end direct messaging between controllers over mock relays

use std::sync::Arc;
use std::time::Duration;

use relaydm_core::{EventBuilder, Keys, Kind, Message, MessageStatus, Tag, Timestamp};
use relaydm_harness::{AckMode, MockRelayNetwork, TestNode};
use relaydm_nostr::{
    AcceptAll, DmNotification, DmStatus, EngineError, MemoryMessageStore, PeerTrustStore,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn network_with(urls: &[&str]) -> Arc<MockRelayNetwork> {
    let network = MockRelayNetwork::new();
    for url in urls {
        network.add_relay(url).await;
    }
    network
}

async fn node(network: &Arc<MockRelayNetwork>) -> TestNode {
    TestNode::new(network, Keys::generate()).await.unwrap()
}

async fn next_received(notifications: &mut broadcast::Receiver<DmNotification>) -> Message {
    timeout(Duration::from_secs(2), async {
        loop {
            match notifications.recv().await {
                Ok(DmNotification::MessageReceived(message)) => return message,
                Ok(_) => continue,
                Err(e) => panic!("notification stream failed: {e}"),
            }
        }
    })
    .await
    .expect("no message received")
}

async fn next_status_change(notifications: &mut broadcast::Receiver<DmNotification>) -> Message {
    timeout(Duration::from_secs(2), async {
        loop {
            match notifications.recv().await {
                Ok(DmNotification::MessageStatusChanged(message)) => return message,
                Ok(_) => continue,
                Err(e) => panic!("notification stream failed: {e}"),
            }
        }
    })
    .await
    .expect("no status change")
}

#[tokio::test]
async fn test_direct_message_round_trip() {
    let network = network_with(&["ws://a.test", "ws://b.test"]).await;
    let alice = node(&network).await;
    let bob = node(&network).await;
    alice.go_online().await.unwrap();
    bob.go_online().await.unwrap();
    let mut inbox = bob.dm.notifications();

    let result = alice.dm.send_dm(&bob.public_key(), "hello bob").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.status, Some(MessageStatus::Accepted));
    let id = result.message_id.unwrap();

    let received = next_received(&mut inbox).await;
    assert_eq!(received.id, id);
    assert_eq!(received.content, "hello bob");
    assert_eq!(received.peer, alice.public_key());
    assert!(!received.is_outgoing);

    // Both relays delivered the event; it materializes once
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.dm.snapshot().await.messages.len(), 1);

    let sent = alice.dm.conversation_with(&bob.public_key()).await.unwrap();
    let got = bob.dm.conversation_with(&alice.public_key()).await.unwrap();
    assert_eq!(sent, got);
    assert_eq!(alice.dm.get_messages_by_conversation(&sent).await.len(), 1);
}

#[tokio::test]
async fn test_silent_relay_does_not_fail_send() {
    let network = network_with(&["ws://a.test", "ws://b.test", "ws://c.test"]).await;
    network
        .relay("ws://b.test")
        .await
        .unwrap()
        .set_ack_mode(AckMode::Silent)
        .await;
    let alice = node(&network).await;
    alice.go_online().await.unwrap();

    let result = alice
        .dm
        .send_dm(&Keys::generate().public_key_hex(), "anyone there")
        .await;
    assert!(result.success);
    assert_eq!(result.status, Some(MessageStatus::Accepted));
}

#[tokio::test]
async fn test_rejected_message_can_be_retried() {
    let network = network_with(&["ws://a.test"]).await;
    let relay = network.relay("ws://a.test").await.unwrap();
    relay.set_ack_mode(AckMode::Reject("blocked: rate limited".into())).await;
    let alice = node(&network).await;
    alice.go_online().await.unwrap();

    let result = alice.dm.send_dm(&Keys::generate().public_key_hex(), "hi").await;
    assert!(!result.success);
    assert_eq!(result.status, Some(MessageStatus::Rejected));
    assert_eq!(result.error.as_deref(), Some("blocked: rate limited"));
    let id = result.message_id.unwrap();

    relay.set_ack_mode(AckMode::Accept).await;
    let retried = alice.dm.retry_failed_message(&id).await.unwrap();
    assert_eq!(retried.status, MessageStatus::Accepted);
    assert_eq!(relay.publish_count(&id).await, 2);

    // Accepted messages are final
    assert!(matches!(
        alice.dm.retry_failed_message(&id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(relay.publish_count(&id).await, 2);
}

#[tokio::test]
async fn test_offline_queue_flushes_when_relay_connects() {
    let network = network_with(&["ws://a.test"]).await;
    let relay = network.relay("ws://a.test").await.unwrap();
    relay.set_refuse_connections(true);
    let alice = node(&network).await;
    assert_eq!(alice.go_online().await.unwrap(), 0);

    let bob = Keys::generate();
    let first = alice.dm.send_dm(&bob.public_key_hex(), "one").await;
    let second = alice.dm.send_dm(&bob.public_key_hex(), "two").await;
    assert_eq!(first.status, Some(MessageStatus::Queued));
    assert_eq!(second.status, Some(MessageStatus::Queued));
    assert!(relay.received_events().await.is_empty());

    let mut updates = alice.dm.notifications();
    relay.set_refuse_connections(false);
    assert_eq!(alice.pool.connect().await, 1);

    let flushed_first = next_status_change(&mut updates).await;
    let flushed_second = next_status_change(&mut updates).await;
    assert_eq!(flushed_first.status, MessageStatus::Accepted);
    assert_eq!(flushed_second.status, MessageStatus::Accepted);

    // Replayed in enqueue order, each exactly once
    let published: Vec<String> = relay
        .received_events()
        .await
        .iter()
        .map(|event| event.id().to_string())
        .collect();
    assert_eq!(
        published,
        vec![first.message_id.unwrap(), second.message_id.unwrap()]
    );

    let report = alice.dm.flush_offline_queue().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(alice.queue.stats().await.accepted, 2);
}

#[tokio::test]
async fn test_queued_messages_survive_restart() {
    let network = network_with(&["ws://a.test"]).await;
    let relay = network.relay("ws://a.test").await.unwrap();
    relay.set_refuse_connections(true);
    let keys = Keys::generate();
    let store = Arc::new(MemoryMessageStore::new());

    let id = {
        let alice =
            TestNode::with_store(&network, keys.clone(), Arc::new(AcceptAll), store.clone())
                .await
                .unwrap();
        let result = alice.dm.send_dm(&Keys::generate().public_key_hex(), "later").await;
        result.message_id.unwrap()
    };

    relay.set_refuse_connections(false);
    let alice = TestNode::with_store(&network, keys, Arc::new(AcceptAll), store)
        .await
        .unwrap();
    assert_eq!(alice.queue.get(&id).await.unwrap().status, MessageStatus::Queued);

    alice.pool.connect().await;
    let report = alice.dm.flush_offline_queue().await.unwrap();
    // The reconnect listener may have flushed first
    assert!(report.accepted <= 1);
    timeout(Duration::from_secs(1), async {
        while alice.queue.get(&id).await.map(|m| m.status) != Some(MessageStatus::Accepted) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(relay.publish_count(&id).await, 1);
}

#[tokio::test]
async fn test_undecryptable_message_is_dropped() {
    let network = network_with(&["ws://a.test"]).await;
    let alice = node(&network).await;
    let bob = node(&network).await;
    alice.go_online().await.unwrap();
    bob.go_online().await.unwrap();
    let mut inbox = bob.dm.notifications();

    let mallory = Keys::generate();
    let garbage = EventBuilder::new(Kind::ENCRYPTED_DIRECT_MESSAGE, "bm90IGVuY3J5cHRlZA==?iv=AAAAAAAAAAAAAAAAAAAAAA==")
        .tag(Tag::public_key(&bob.public_key()))
        .to_event(&mallory)
        .unwrap();
    network
        .relay("ws://a.test")
        .await
        .unwrap()
        .inject_event(garbage)
        .await;

    alice.dm.send_dm(&bob.public_key(), "readable").await;
    let received = next_received(&mut inbox).await;
    assert_eq!(received.content, "readable");

    assert_eq!(bob.dm.stats().dropped_undecryptable, 1);
    assert_eq!(bob.dm.snapshot().await.messages.len(), 1);
}

#[tokio::test]
async fn test_blocked_sender_is_dropped() {
    let network = network_with(&["ws://a.test"]).await;
    let eve = node(&network).await;
    let alice = node(&network).await;

    let trust = Arc::new(PeerTrustStore::new());
    trust.block(&eve.public_key()).await;
    let bob = TestNode::with_trust(&network, Keys::generate(), trust)
        .await
        .unwrap();

    for peer in [&eve, &alice, &bob] {
        peer.go_online().await.unwrap();
    }
    let mut inbox = bob.dm.notifications();

    eve.dm.send_dm(&bob.public_key(), "let me in").await;
    alice.dm.send_dm(&bob.public_key(), "hi bob").await;

    let received = next_received(&mut inbox).await;
    assert_eq!(received.peer, alice.public_key());
    assert_eq!(bob.dm.stats().dropped_untrusted, 1);
}

#[tokio::test]
async fn test_sync_recovers_missed_messages_once() {
    let network = network_with(&["ws://a.test"]).await;
    let alice = node(&network).await;
    let bob = node(&network).await;
    alice.go_online().await.unwrap();

    let sent = alice.dm.send_dm(&bob.public_key(), "while you were out").await;
    assert!(sent.success);

    bob.pool.connect().await;
    let report = bob.dm.sync_missed_messages(Timestamp::from_secs(0)).await.unwrap();
    assert_eq!(report.relays_queried, 1);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.merged, 1);

    let again = bob.dm.sync_missed_messages(Timestamp::from_secs(0)).await.unwrap();
    assert_eq!(again.merged, 0);
    assert_eq!(again.duplicates, 1);

    let messages = bob.dm.snapshot().await.messages;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "while you were out");
    assert_eq!(messages[0].status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_sync_restores_own_messages_on_new_device() {
    let network = network_with(&["ws://a.test"]).await;
    let keys = Keys::generate();
    let first_device = TestNode::new(&network, keys.clone()).await.unwrap();
    first_device.go_online().await.unwrap();
    let bob = Keys::generate();
    first_device.dm.send_dm(&bob.public_key_hex(), "from my phone").await;

    let second_device = TestNode::new(&network, keys).await.unwrap();
    second_device.pool.connect().await;
    let report = second_device
        .dm
        .sync_missed_messages(Timestamp::from_secs(0))
        .await
        .unwrap();
    assert_eq!(report.merged, 1);

    let conversation = second_device
        .dm
        .conversation_with(&bob.public_key_hex())
        .await
        .unwrap();
    let messages = second_device.dm.get_messages_by_conversation(&conversation).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_outgoing);
    assert_eq!(messages[0].content, "from my phone");
    assert_eq!(messages[0].status, MessageStatus::Accepted);
}

#[tokio::test]
async fn test_persistence_failure_fails_send_without_publishing() {
    let network = network_with(&["ws://a.test"]).await;
    let alice = node(&network).await;
    alice.go_online().await.unwrap();
    alice.store.set_fail_writes(true);

    let result = alice.dm.send_dm(&Keys::generate().public_key_hex(), "lost?").await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Persistence"));
    assert!(alice.dm.snapshot().await.messages.is_empty());
    assert!(network
        .relay("ws://a.test")
        .await
        .unwrap()
        .received_events()
        .await
        .is_empty());
}

#[tokio::test]
async fn test_subscribe_twice_sends_one_request() {
    let network = network_with(&["ws://a.test"]).await;
    let bob = node(&network).await;
    bob.go_online().await.unwrap();
    bob.dm.subscribe_to_incoming_dms().await.unwrap();
    assert_eq!(bob.dm.status(), DmStatus::Subscribed);

    let relay = network.relay("ws://a.test").await.unwrap();
    timeout(Duration::from_secs(1), async {
        while relay.subscription_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(relay.subscription_count().await, 1);

    assert!(bob.dm.unsubscribe_from_dms().await);
    timeout(Duration::from_secs(1), async {
        while relay.subscription_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
