#![allow(dead_code)]

use async_trait::async_trait;
use refresher::app::RefresherApp;
use refresher::config::{QueueConfig, RefresherConfig};
use refresher::envelope::{Envelope, Message};
use refresher::pipeline::changes::{ChangeRequest, ChangeStore};
use refresher::pipeline::{Pipeline, StoreError};
use refresher::transport::memory::MemoryBroker;
use refresher::transport::BrokerError;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the in-process broker with fast reconnects and one entry per queue.
pub fn memory_config(queues: &[&str]) -> RefresherConfig {
    let mut config = RefresherConfig::default();
    config.broker.url = "memory://".to_string();
    config.broker.reconnect_initial = Duration::from_millis(10);
    config.broker.reconnect_max = Duration::from_millis(100);
    config.queues = queues.iter().map(|name| QueueConfig::new(*name)).collect();
    config
}

pub fn queue_config<'a>(config: &'a mut RefresherConfig, name: &str) -> &'a mut QueueConfig {
    config
        .queues
        .iter_mut()
        .find(|queue| queue.name == name)
        .expect("queue configured")
}

pub async fn build_app(broker: &MemoryBroker, config: RefresherConfig) -> RefresherApp {
    RefresherApp::with_driver(config, Arc::new(broker.clone()))
        .await
        .expect("app initialises against the memory broker")
}

/// A running [`RefresherApp`] and the handle needed to stop it.
pub struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<refresher::Result<()>>,
}

impl Running {
    pub fn start(app: RefresherApp) -> Self {
        let shutdown = app.shutdown_token();
        let handle = tokio::spawn(app.run());
        Self { shutdown, handle }
    }

    pub async fn stop(self) -> refresher::Result<()> {
        self.shutdown.cancel();
        self.handle.await.expect("app task joins")
    }
}

/// Polls `check` every 10ms, panicking after 3000 tries.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..3000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn stored_envelope(broker: &MemoryBroker, queue: &str, index: usize) -> Envelope {
    let messages = broker.peek(queue);
    let message = messages.get(index).expect("message present");
    Envelope::from_headers(&message.headers, queue).expect("valid envelope")
}

#[derive(Clone, Copy, Debug)]
pub enum Script {
    Ack,
    Retry,
    LeaveUnsettled,
    Panic,
    Error,
    /// Reports a lost connection on the first batch without settling it, then acks.
    DisconnectOnce,
}

/// Pipeline that records every batch and reacts as scripted.
#[derive(Clone)]
pub struct ScriptedPipeline {
    script: Script,
    batches: Arc<Mutex<Vec<Vec<JsonValue>>>>,
    disconnected: Arc<AtomicBool>,
}

impl ScriptedPipeline {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            batches: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .expect("batches lock")
            .iter()
            .map(Vec::len)
            .collect()
    }

    pub fn processed(&self) -> Vec<JsonValue> {
        self.batches
            .lock()
            .expect("batches lock")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    type Payload = JsonValue;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn process(&self, batch: Vec<Message<JsonValue>>) -> refresher::Result<()> {
        self.batches
            .lock()
            .expect("batches lock")
            .push(batch.iter().map(|message| message.payload().clone()).collect());

        match self.script {
            Script::Ack => {
                for message in &batch {
                    message.ack().await?;
                }
                Ok(())
            }
            Script::Retry => {
                for message in &batch {
                    message.retry().await?;
                }
                Ok(())
            }
            Script::LeaveUnsettled => Ok(()),
            Script::Panic => panic!("scripted pipeline panic"),
            Script::Error => Err(refresher::err!("scripted pipeline failure")),
            Script::DisconnectOnce => {
                if !self.disconnected.swap(true, Ordering::SeqCst) {
                    return Err(BrokerError::Closed.into());
                }
                for message in &batch {
                    message.ack().await?;
                }
                Ok(())
            }
        }
    }
}

/// Change store keyed by change number.
#[derive(Default)]
pub struct MemoryChangeStore {
    rows: Mutex<HashSet<u64>>,
    unavailable: bool,
    calls: AtomicU32,
}

impl MemoryChangeStore {
    pub fn with_rows(rows: impl IntoIterator<Item = u64>) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, change_number: u64) -> bool {
        self.rows.lock().expect("rows lock").contains(&change_number)
    }
}

#[async_trait]
impl ChangeStore for MemoryChangeStore {
    async fn insert_change(&self, change: &ChangeRequest) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        if !self.rows.lock().expect("rows lock").insert(change.change_number) {
            return Err(StoreError::Duplicate(format!(
                "change {} exists",
                change.change_number
            )));
        }
        Ok(())
    }
}

pub fn count_actions(results: &[bool]) -> usize {
    results.iter().filter(|applied| **applied).count()
}
