#[path = "support/mod.rs"]
mod support;

use refresher::dedup::{DedupGuard, DedupKey, MemoryDedupStore};
use refresher::producer::EnqueueOutcome;
use refresher::transport::memory::MemoryBroker;
use refresher::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{build_app, memory_config, stored_envelope};

#[tokio::test]
async fn second_request_within_the_window_is_rejected() {
    let broker = MemoryBroker::new();
    let app = build_app(&broker, memory_config(&["app"])).await;
    let producer = app.producer();

    let first = producer
        .enqueue("app", 440, &json!({ "app_id": 440 }))
        .await
        .expect("enqueue");
    let second = producer
        .enqueue("app", 440, &json!({ "app_id": 440 }))
        .await
        .expect("enqueue");
    let other = producer
        .enqueue("app", 730, &json!({ "app_id": 730 }))
        .await
        .expect("enqueue");

    assert_eq!(first, EnqueueOutcome::Queued);
    assert_eq!(second, EnqueueOutcome::AlreadyQueued);
    assert_eq!(other, EnqueueOutcome::Queued);
    assert_eq!(broker.depth("app"), 2);

    let envelope = stored_envelope(&broker, "app", 0);
    assert_eq!(envelope.attempt, 1);
    assert_eq!(envelope.first_queue, "app");
    assert_eq!(envelope.first_seen, envelope.last_seen);
    app.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_entity_publish_once() {
    let broker = MemoryBroker::new();
    let app = build_app(&broker, memory_config(&["app"])).await;

    let a = app.producer();
    let b = app.producer();
    let first = tokio::spawn(async move { a.enqueue("app", 440, &json!({ "app_id": 440 })).await });
    let second =
        tokio::spawn(async move { b.enqueue("app", 440, &json!({ "app_id": 440 })).await });

    let mut outcomes = vec![
        first.await.expect("join").expect("enqueue"),
        second.await.expect("join").expect("enqueue"),
    ];
    outcomes.sort_by_key(|outcome| *outcome == EnqueueOutcome::AlreadyQueued);

    assert_eq!(
        outcomes,
        vec![EnqueueOutcome::Queued, EnqueueOutcome::AlreadyQueued]
    );
    assert_eq!(broker.depth("app"), 1);
    app.close().await;
}

#[tokio::test(start_paused = true)]
async fn requests_are_accepted_again_once_the_marker_expires() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["app"]);
    config.dedup.ttl = Duration::from_secs(30);
    let app = build_app(&broker, config).await;
    let producer = app.producer();

    let payload = json!({ "app_id": 440 });
    assert_eq!(
        producer.enqueue("app", 440, &payload).await.expect("enqueue"),
        EnqueueOutcome::Queued
    );

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(
        producer.enqueue("app", 440, &payload).await.expect("enqueue"),
        EnqueueOutcome::AlreadyQueued
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        producer.enqueue("app", 440, &payload).await.expect("enqueue"),
        EnqueueOutcome::Queued
    );
    assert_eq!(broker.depth("app"), 2);
    app.close().await;
}

#[tokio::test]
async fn unknown_kinds_are_rejected_without_reserving_a_marker() {
    let broker = MemoryBroker::new();
    let app = build_app(&broker, memory_config(&["app"])).await;

    let err = app
        .producer()
        .enqueue("package", 1, &json!({ "id": 1 }))
        .await
        .expect_err("unknown queue");
    assert!(matches!(err, Error::UnknownQueue(ref name) if name == "package"));
    app.close().await;
}

#[tokio::test(start_paused = true)]
async fn guard_keys_are_scoped_by_kind() {
    let store = Arc::new(MemoryDedupStore::new());
    let guard = DedupGuard::new(store.clone(), "queue", Duration::from_secs(60));

    assert!(guard.reserve(&DedupKey::new("app", 440)).await.expect("reserve"));
    assert!(guard.reserve(&DedupKey::new("package", 440)).await.expect("reserve"));
    assert!(!guard.reserve(&DedupKey::new("app", 440)).await.expect("reserve"));
    assert_eq!(store.len(), 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(store.sweep(), 2);
    assert!(store.is_empty());
}
