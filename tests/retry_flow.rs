#[path = "support/mod.rs"]
mod support;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refresher::pipeline::app_players::{
    App, AppDirectory, AppPlayersPipeline, AppPlayersRequest, PlayerCountSource,
    PlayerCountStore,
};
use refresher::connection::{Connection, ConnectionState};
use refresher::pipeline::changes::{ChangeRequest, ChangeStore, ChangesPipeline};
use refresher::pipeline::{ExternalError, Notifier, StoreError};
use refresher::transport::memory::MemoryBroker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{
    build_app, eventually, memory_config, queue_config, stored_envelope, MemoryChangeStore,
    Running,
};

fn change(number: u64, apps: Vec<u64>) -> ChangeRequest {
    ChangeRequest {
        change_number: number,
        apps,
        packages: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_the_budget_then_land_in_the_dead_queue() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["changes"]);
    {
        let queue = queue_config(&mut config, "changes");
        queue.batch_size = 1;
        queue.max_attempts = 3;
        queue.retry_delay = Duration::from_secs(1);
    }
    let mut app = build_app(&broker, config).await;
    let store = Arc::new(MemoryChangeStore::unavailable());
    let policy = app.retry_policy("changes");
    app.register("changes", ChangesPipeline::new(store.clone(), policy))
        .expect("register");

    app.producer()
        .enqueue("changes", 1, &change(1, vec![440]))
        .await
        .expect("enqueue");
    let running = Running::start(app);

    eventually("message dead-lettered", || broker.depth("failed") == 1).await;
    running.stop().await.expect("clean shutdown");

    assert_eq!(store.calls(), 3);
    let envelope = stored_envelope(&broker, "failed", 0);
    assert_eq!(envelope.attempt, 4);
    assert_eq!(envelope.first_queue, "changes");
    assert_eq!(envelope.last_queue, "changes");
    assert!(envelope.last_seen >= envelope.first_seen);
    assert_eq!(broker.depth("changes"), 0);
    assert_eq!(broker.depth("changes.delay"), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_inserts_are_treated_as_success() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["changes"]);
    queue_config(&mut config, "changes").batch_size = 1;
    let mut app = build_app(&broker, config).await;
    let store = Arc::new(MemoryChangeStore::with_rows([7]));
    let policy = app.retry_policy("changes");
    app.register("changes", ChangesPipeline::new(store.clone(), policy))
        .expect("register");

    app.producer()
        .enqueue("changes", 7, &change(7, Vec::new()))
        .await
        .expect("enqueue");
    let running = Running::start(app);

    eventually("duplicate acked", || broker.stats().acked == 1).await;
    running.stop().await.expect("clean shutdown");

    assert_eq!(store.calls(), 1);
    assert_eq!(broker.depth("changes.delay"), 0);
    assert_eq!(broker.depth("failed"), 0);
}

#[tokio::test(start_paused = true)]
async fn recorded_changes_notify_every_touched_app() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["changes", "app"]);
    queue_config(&mut config, "changes").batch_size = 1;
    let mut app = build_app(&broker, config).await;
    let store = Arc::new(MemoryChangeStore::default());
    let notifier: Arc<dyn Notifier> = Arc::new(app.producer());
    let policy = app.retry_policy("changes");
    app.register(
        "changes",
        ChangesPipeline::new(store.clone(), policy).notify_apps(notifier, "app"),
    )
    .expect("register");

    app.producer()
        .enqueue("changes", 12, &change(12, vec![440, 730]))
        .await
        .expect("enqueue");
    let running = Running::start(app);

    eventually("notifications published", || broker.depth("app") == 2).await;
    running.stop().await.expect("clean shutdown");

    assert!(store.contains(12));
    let ids: Vec<u64> = broker
        .peek("app")
        .iter()
        .map(|message| {
            serde_json::from_slice::<AppPlayersRequest>(&message.body)
                .expect("app request")
                .app_id
        })
        .collect();
    assert_eq!(ids, vec![440, 730]);
}

/// Drops the broker connection during its first insert and reports the store as down once
/// the worker has reconnected.
struct SeveringStore {
    broker: MemoryBroker,
    connection: Connection,
    rows: MemoryChangeStore,
    severed: AtomicBool,
}

#[async_trait]
impl ChangeStore for SeveringStore {
    async fn insert_change(&self, change: &ChangeRequest) -> Result<(), StoreError> {
        if self.severed.swap(true, Ordering::SeqCst) {
            return self.rows.insert_change(change).await;
        }
        let generation = self.connection.generation();
        self.broker.sever_connections();
        while self.connection.generation() == generation
            || self.connection.state() != ConnectionState::Connected
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(StoreError::Unavailable("connection reset".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn a_lost_connection_mid_batch_leaves_the_batch_to_the_broker() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["changes"]);
    {
        let queue = queue_config(&mut config, "changes");
        queue.batch_size = 2;
        queue.retry_delay = Duration::from_secs(1);
    }
    let mut app = build_app(&broker, config).await;
    let store = Arc::new(SeveringStore {
        broker: broker.clone(),
        connection: app.connection().clone(),
        rows: MemoryChangeStore::default(),
        severed: AtomicBool::new(false),
    });
    let policy = app.retry_policy("changes");
    app.register("changes", ChangesPipeline::new(store.clone(), policy))
        .expect("register");

    for number in [1, 2] {
        app.producer()
            .enqueue("changes", number, &change(number, Vec::new()))
            .await
            .expect("enqueue");
    }
    let running = Running::start(app);

    eventually("redelivered batch acked", || broker.stats().acked == 2).await;
    running.stop().await.expect("clean shutdown");

    assert!(store.rows.contains(1));
    assert!(store.rows.contains(2));
    assert_eq!(store.rows.calls(), 3);
    assert_eq!(broker.depth("failed"), 0);
    assert_eq!(broker.depth("changes.delay"), 0);
    assert_eq!(broker.depth("changes"), 0);
    assert_eq!(broker.stats().requeued, 2);
}

struct Directory(HashMap<u64, App>);

#[async_trait]
impl AppDirectory for Directory {
    async fn resolve(&self, ids: &[u64]) -> Result<HashMap<u64, App>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.0.get(id).map(|app| (*id, app.clone())))
            .collect())
    }
}

struct FixedCount(u64);

#[async_trait]
impl PlayerCountSource for FixedCount {
    async fn player_count(&self, _app_id: u64) -> Result<u64, ExternalError> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct RecordedCounts(Mutex<Vec<(u64, u64)>>);

#[async_trait]
impl PlayerCountStore for RecordedCounts {
    async fn record(
        &self,
        app_id: u64,
        players: u64,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.0.lock().expect("counts lock").push((app_id, players));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_apps_are_acked_without_blocking_the_batch() {
    let broker = MemoryBroker::new();
    let mut config = memory_config(&["app"]);
    queue_config(&mut config, "app").batch_max_wait = Duration::from_millis(100);
    let mut app = build_app(&broker, config).await;

    let directory = Directory(HashMap::from([(
        440,
        App {
            id: 440,
            name: "Team Fortress 2".to_string(),
        },
    )]));
    let counts = Arc::new(RecordedCounts::default());
    let pipeline = AppPlayersPipeline::new(
        Arc::new(directory),
        Arc::new(FixedCount(1_234)),
        counts.clone(),
        app.limiters(),
    )
    .with_policy(app.retry_policy("app"))
    .with_shutdown(app.shutdown_token());
    app.register("app", pipeline).expect("register");

    let producer = app.producer();
    for id in [440, 999] {
        producer
            .enqueue("app", id, &AppPlayersRequest { app_id: id })
            .await
            .expect("enqueue");
    }
    let running = Running::start(app);

    eventually("both acked", || broker.stats().acked == 2).await;
    running.stop().await.expect("clean shutdown");

    assert_eq!(*counts.0.lock().expect("counts lock"), vec![(440, 1_234)]);
    assert_eq!(broker.depth("failed"), 0);
    assert_eq!(broker.depth("app.delay"), 0);
}
