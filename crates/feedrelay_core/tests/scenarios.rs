//! End-to-end relay scenarios over in-memory collaborators.

use feedrelay_core::{CheckpointStore, OperationKind, Relay, RelayError, RelayState};
use feedrelay_testkit::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for(condition: impl FnMut() -> bool) {
    assert!(wait_until(WAIT_TIMEOUT, condition).await, "condition not reached");
}

async fn received(relay: &Relay, count: u64) {
    wait_for(|| relay.stats().events_received >= count).await;
}

#[tokio::test]
async fn inserts_are_published_and_checkpointed() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.log.insert(test_document("a2", 2));
    harness.expect_messages(2).await;
    relay.stop().await.unwrap();

    let payloads = harness.broker.payloads();
    assert_eq!(payloads.len(), 2);
    assert!(payloads.contains(&test_document("a1", 1)));
    assert!(payloads.contains(&test_document("a2", 2)));
    for message in harness.broker.messages() {
        assert_eq!(message.destination.exchange, TEST_EXCHANGE);
        assert_eq!(message.destination.routing_key, "");
    }

    assert_eq!(harness.store.len(), 1);
    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    assert_eq!(checkpoint.last_handled_document_key, Some(json!({ "_id": "a2" })));
    assert_eq!(checkpoint.collection, TEST_COLLECTION);
}

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    // Written before the first-ever start: no checkpoint, so it is skipped.
    harness.log.insert(test_document("a0", 0));

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.log.insert(test_document("a2", 2));
    harness.expect_messages(2).await;
    relay.stop().await.unwrap();

    harness.log.insert(test_document("a3", 3));
    harness.log.insert(test_document("a4", 4));

    relay.start().await.unwrap();
    harness.expect_messages(4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.stop().await.unwrap();

    let payloads = harness.broker.payloads();
    assert_eq!(payloads.len(), 4);
    assert!(!payloads.contains(&test_document("a0", 0)));
    assert!(payloads[2..].contains(&test_document("a3", 3)));
    assert!(payloads[2..].contains(&test_document("a4", 4)));
}

#[tokio::test]
async fn deletes_publish_only_the_key() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Delete], 2))
        .unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.log.delete(json!("a1"));
    harness.expect_messages(1).await;
    received(&relay, 2).await;
    relay.stop().await.unwrap();

    assert_eq!(harness.broker.payloads(), vec![json!({ "_id": "a1" })]);
}

#[tokio::test]
async fn filtered_events_do_not_advance_checkpoint_counter() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    relay.start().await.unwrap();
    let first = harness.log.insert(test_document("a1", 1));
    harness.log.update(json!("a1"), json!({ "field1": "changed" }));
    harness.log.delete(json!("a1"));
    received(&relay, 3).await;

    // Only one insert handled: below the interval, nothing written.
    assert!(harness.store.history().is_empty());

    let second = harness.log.insert(test_document("a2", 2));
    harness.expect_messages(2).await;
    relay.stop().await.unwrap();

    let stats = relay.stats();
    assert_eq!(stats.events_filtered, 2);
    assert_eq!(stats.events_handled, 2);
    let history = harness.store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].resume_position, second);
    assert!(history[0].resume_position > first);
}

#[tokio::test]
async fn updates_publish_looked_up_document() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Update], 1))
        .unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.log.update(json!("a1"), json!({ "field1": "changed" }));
    harness.expect_messages(1).await;
    relay.stop().await.unwrap();

    assert_eq!(
        harness.broker.payloads(),
        vec![json!({ "_id": "a1", "field1": "changed", "field2": "test-2" })]
    );
}

#[tokio::test]
async fn checkpoint_bound_after_restart() {
    let harness = RelayHarness::new();
    let concurrency = 3;

    let first = harness
        .relay(harness.config(&[OperationKind::Insert], concurrency))
        .unwrap();
    first.start().await.unwrap();
    for n in 0..7 {
        harness.log.insert(test_document(&format!("d{n}"), n));
    }
    harness.expect_messages(7).await;
    first.stop().await.unwrap();

    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    assert_eq!(checkpoint.last_handled_document_key, Some(json!({ "_id": "d5" })));

    // A new process over the same source and checkpoint store.
    let second = harness
        .relay(harness.config(&[OperationKind::Insert], concurrency))
        .unwrap();
    second.start().await.unwrap();
    harness.expect_messages(8).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.stop().await.unwrap();

    let payloads = harness.broker.payloads();
    assert_eq!(payloads.len(), 8, "7 mod 3 = 1 event is redelivered");
    assert_eq!(payloads[7], test_document("d6", 6));
}

#[tokio::test]
async fn subscription_loss_is_surfaced_and_restart_resumes() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 1))
        .unwrap();
    let mut errors = relay.take_error_receiver().unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.expect_messages(1).await;
    wait_for(|| harness.store.get(TEST_RELAY_IDENTITY).is_some()).await;

    harness.log.fail_subscriptions("node is recovering");
    let err = within_timeout(errors.recv()).await.unwrap();
    assert!(matches!(err, RelayError::Subscription(_)));
    assert!(err.is_fatal());
    wait_for(|| !relay.is_consuming()).await;

    relay.stop().await.unwrap();
    harness.log.insert(test_document("a2", 2));
    relay.start().await.unwrap();
    harness.expect_messages(2).await;
    relay.stop().await.unwrap();

    assert_eq!(
        harness.broker.payloads(),
        vec![test_document("a1", 1), test_document("a2", 2)]
    );
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_everything() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    relay.stop().await.unwrap();
    assert_eq!(harness.broker.connect_count(), 0);

    relay.start().await.unwrap();
    assert!(harness.log.is_connected());
    assert_eq!(harness.log.open_streams(), 1);

    relay.stop().await.unwrap();
    relay.stop().await.unwrap();

    assert_eq!(relay.state(), RelayState::Stopped);
    assert_eq!(harness.log.open_streams(), 0);
    assert!(!harness.log.is_connected());
    assert!(!harness.broker.is_connected());
    assert_eq!(harness.broker.close_count(), 1);
}

#[tokio::test]
async fn stop_flushes_pending_checkpoint() {
    let harness = RelayHarness::new();
    harness.store.set_save_delay(Some(Duration::from_millis(200)));
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 1))
        .unwrap();

    relay.start().await.unwrap();
    let position = harness.log.insert(test_document("a1", 1));
    harness.expect_messages(1).await;
    relay.stop().await.unwrap();

    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    assert_eq!(checkpoint.resume_position, position);
}

#[tokio::test]
async fn checkpoint_writes_never_overlap() {
    let harness = RelayHarness::new();
    harness.store.set_save_delay(Some(Duration::from_millis(10)));
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 1))
        .unwrap();

    relay.start().await.unwrap();
    for n in 0..10 {
        harness.log.insert(test_document(&format!("d{n}"), n));
    }
    harness.expect_messages(10).await;
    relay.stop().await.unwrap();

    assert_eq!(harness.store.max_concurrent_saves(), 1);
    let history = harness.store.history();
    assert_eq!(history.len(), 10);
    assert!(history
        .windows(2)
        .all(|w| w[0].resume_position < w[1].resume_position));
}

#[tokio::test]
async fn publish_failure_is_isolated() {
    let harness = RelayHarness::new();
    harness.broker.reject_next(1);
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 1))
        .unwrap();
    let mut errors = relay.take_error_receiver().unwrap();

    relay.start().await.unwrap();
    for n in 1..=3 {
        harness.log.insert(test_document(&format!("a{n}"), n));
    }

    let err = within_timeout(errors.recv()).await.unwrap();
    assert!(matches!(err, RelayError::Publish(_)));
    assert!(!err.is_fatal());

    harness.expect_messages(2).await;
    assert!(relay.is_consuming());
    relay.stop().await.unwrap();

    let stats = relay.stats();
    assert_eq!(stats.publish_failures, 1);
    assert_eq!(stats.published, 2);
    assert_eq!(stats.events_handled, 3);
}

#[tokio::test]
async fn publishes_run_with_bounded_concurrency() {
    let harness = RelayHarness::new();
    harness.broker.set_delay(Some(Duration::from_millis(20)));
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 3))
        .unwrap();

    relay.start().await.unwrap();
    for n in 0..12 {
        harness.log.insert(test_document(&format!("d{n}"), n));
    }
    harness.expect_messages(12).await;
    relay.stop().await.unwrap();

    assert!(harness.broker.max_in_flight() <= 3);
    assert!(relay.stats().max_in_flight <= 3);
}

#[tokio::test]
async fn unreachable_sink_fails_start() {
    let harness = RelayHarness::new();
    harness.broker.set_reachable(false);
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    let result = relay.start().await;
    assert!(matches!(result, Err(RelayError::Connection { .. })));
    assert_eq!(relay.state(), RelayState::Stopped);
    assert_eq!(harness.log.connect_count(), 0);
}

#[tokio::test]
async fn unreachable_source_fails_start() {
    let harness = RelayHarness::new();
    harness.log.set_reachable(false);
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 2))
        .unwrap();

    let result = relay.start().await;
    assert!(matches!(result, Err(RelayError::Connection { ref target, .. }) if target == "source"));
    assert_eq!(relay.state(), RelayState::Stopped);
    assert!(!harness.broker.is_connected());
}

#[tokio::test]
async fn checkpointing_disabled_always_starts_from_now() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(test_config(&[OperationKind::Insert], 1))
        .unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    harness.expect_messages(1).await;
    relay.stop().await.unwrap();

    harness.log.insert(test_document("a2", 2));
    relay.start().await.unwrap();
    harness.log.insert(test_document("a3", 3));
    harness.expect_messages(2).await;
    relay.stop().await.unwrap();

    assert_eq!(
        harness.broker.payloads(),
        vec![test_document("a1", 1), test_document("a3", 3)]
    );
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn file_checkpoints_survive_restart() {
    let (_dir, store) = temp_file_store();
    let store: Arc<dyn CheckpointStore> = Arc::new(store);
    let log = Arc::new(MemoryChangeLog::new());
    let broker = Arc::new(RecordingBroker::new());
    let config = RelayHarness::new().config(&[OperationKind::Insert], 1);

    let relay = Relay::new(config.clone(), log.clone(), broker.clone(), Some(store.clone())).unwrap();
    relay.start().await.unwrap();
    log.insert(test_document("a1", 1));
    assert!(broker.wait_for_messages(1, WAIT_TIMEOUT).await);
    relay.stop().await.unwrap();

    log.insert(test_document("a2", 2));

    let restarted = Relay::new(config, log.clone(), broker.clone(), Some(store)).unwrap();
    restarted.start().await.unwrap();
    assert!(broker.wait_for_messages(2, WAIT_TIMEOUT).await);
    restarted.stop().await.unwrap();

    assert_eq!(
        broker.payloads(),
        vec![test_document("a1", 1), test_document("a2", 2)]
    );
}

#[tokio::test]
async fn malformed_event_halts_the_run() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Insert], 1))
        .unwrap();
    let mut errors = relay.take_error_receiver().unwrap();

    relay.start().await.unwrap();
    harness
        .log
        .push_raw(OperationKind::Insert, Some(json!({ "_id": "x" })), None);

    let err = within_timeout(errors.recv()).await.unwrap();
    assert!(matches!(err, RelayError::Transform { operation: OperationKind::Insert, .. }));
    wait_for(|| !relay.is_consuming()).await;
    relay.stop().await.unwrap();

    assert_eq!(harness.broker.message_count(), 0);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn update_of_deleted_document_does_not_wedge_restarts() {
    let harness = RelayHarness::new();
    harness.log.insert(test_document("a1", 1));
    harness.log.insert(test_document("a2", 2));
    let relay = harness
        .relay(harness.config(&[OperationKind::Update], 1))
        .unwrap();
    let mut errors = relay.take_error_receiver().unwrap();

    relay.start().await.unwrap();
    harness.log.update(json!("a1"), json!({ "field1": "changed" }));
    harness.expect_messages(1).await;
    relay.stop().await.unwrap();

    // The post-image lookup for the second a1 update finds nothing.
    harness.log.update(json!("a1"), json!({ "field1": "again" }));
    harness.log.delete(json!("a1"));
    harness.log.update(json!("a2"), json!({ "field1": "changed" }));

    relay.start().await.unwrap();
    harness.expect_messages(3).await;
    relay.stop().await.unwrap();

    relay.start().await.unwrap();
    assert!(relay.is_consuming());
    relay.stop().await.unwrap();

    let payloads = harness.broker.payloads();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0]["field1"], "changed");
    assert_eq!(payloads[1], Value::Null);
    assert_eq!(payloads[2]["_id"], "a2");
    assert!(errors.try_recv().is_err());

    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    assert_eq!(checkpoint.last_handled_document_key, Some(json!({ "_id": "a2" })));
}

#[tokio::test]
async fn collection_events_publish_an_envelope() {
    let harness = RelayHarness::new();
    let relay = harness
        .relay(harness.config(&[OperationKind::Drop], 1))
        .unwrap();
    let mut errors = relay.take_error_receiver().unwrap();

    relay.start().await.unwrap();
    harness.log.insert(test_document("a1", 1));
    let dropped = harness.log.collection_event(OperationKind::Drop);
    harness.expect_messages(1).await;
    relay.stop().await.unwrap();

    let payload = &harness.broker.payloads()[0];
    assert_eq!(payload["operationKind"], "drop");
    assert_eq!(payload["sourcePosition"], json!(dropped.as_str()));
    assert!(payload["documentKey"].is_null());
    assert!(payload["fullDocument"].is_null());
    assert!(errors.try_recv().is_err());

    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    assert_eq!(checkpoint.resume_position, dropped);
    assert_eq!(checkpoint.last_handled_document_key, None);
}

#[tokio::test]
async fn crash_loses_at_most_concurrency_publishes() {
    let concurrency = 2;
    let harness = RelayHarness::new();
    harness.broker.set_delay(Some(Duration::from_millis(20)));
    let config = harness.config(&[OperationKind::Insert], concurrency);
    let relay = harness.relay(config.clone()).unwrap();

    relay.start().await.unwrap();
    for n in 0..20u64 {
        harness.log.insert(test_document(&format!("d{n}"), n));
    }
    wait_for(|| relay.stats().events_handled == 20).await;

    // Crash without stop: publishes that have not completed never reach the
    // broker and the consumer is gone.
    harness.broker.set_rejecting(true);
    drop(relay);
    wait_for(|| harness.log.open_streams() == 0).await;

    let checkpoint = harness.store.get(TEST_RELAY_IDENTITY).unwrap();
    let events = harness.log.events();
    let checkpointed = events
        .iter()
        .position(|e| e.source_position == checkpoint.resume_position)
        .unwrap();
    let replayed = events.len() - checkpointed - 1;

    let recovered = Arc::new(RecordingBroker::new());
    let restarted = Relay::new(
        config,
        harness.log.clone(),
        recovered.clone(),
        Some(harness.store.clone()),
    )
    .unwrap();
    restarted.start().await.unwrap();
    assert!(recovered.wait_for_messages(replayed, WAIT_TIMEOUT).await);
    restarted.stop().await.unwrap();

    let delivered: BTreeSet<String> = harness
        .broker
        .payloads()
        .into_iter()
        .chain(recovered.payloads())
        .filter_map(|payload| payload["_id"].as_str().map(str::to_owned))
        .collect();
    let lost = 20 - delivered.len();
    assert!(
        lost <= concurrency,
        "lost {lost} events, checkpoint at {}",
        checkpoint.resume_position
    );
}
