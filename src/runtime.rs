use crate::consumer::BatchConsumer;
use crate::error::Result;
use crate::transport::BrokerError;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerHealth {
    Idle,
    Starting,
    Running,
    Degraded { reason: String },
    Shutdown,
}

type WorkerTask = (String, JoinHandle<std::result::Result<(), BrokerError>>);

/// Runs one task per queue subscription. A slow pipeline only slows its own queue.
pub struct WorkerRuntime {
    pending: Vec<BatchConsumer>,
    tasks: Arc<Mutex<Vec<WorkerTask>>>,
    health: Arc<Mutex<WorkerHealth>>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            pending: Vec::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            health: Arc::new(Mutex::new(WorkerHealth::Idle)),
            shutdown,
        }
    }

    pub fn add(&mut self, consumer: BatchConsumer) {
        self.pending.push(consumer);
    }

    pub fn worker_count(&self) -> usize {
        self.pending.len()
            + self
                .tasks
                .lock()
                .expect("worker task collection lock poisoned")
                .len()
    }

    pub fn health(&self) -> WorkerHealth {
        self.health
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(WorkerHealth::Degraded {
                reason: "failed to read worker health state".to_string(),
            })
    }

    fn update_health(&self, value: WorkerHealth) {
        if let Ok(mut guard) = self.health.lock() {
            *guard = value;
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Err(crate::err!("no workers registered"));
        }

        self.update_health(WorkerHealth::Starting);
        let spawned: Vec<WorkerTask> = self
            .pending
            .drain(..)
            .map(|consumer| {
                let name = consumer.queue_name().to_string();
                let token = self.shutdown.child_token();
                let shutdown = self.shutdown.clone();
                let task = tokio::spawn(async move {
                    let result = consumer.run(token).await;
                    if result.is_err() {
                        shutdown.cancel();
                    }
                    result
                });
                (name, task)
            })
            .collect();

        self.tasks
            .lock()
            .expect("worker task collection lock poisoned")
            .extend(spawned);
        self.update_health(WorkerHealth::Running);
        Ok(())
    }

    /// Waits for every worker to finish. A failing worker cancels the shared token, so the
    /// rest stop too. The first failure marks the runtime degraded and is returned once all
    /// workers have stopped.
    pub async fn wait(&self) -> Result<()> {
        let mut first_error = None;

        loop {
            let next = self
                .tasks
                .lock()
                .expect("worker task collection lock poisoned")
                .pop();
            let Some((queue, handle)) = next else {
                break;
            };

            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(crate::err!("worker for queue `{queue}` failed: {err}")),
                Err(join_err) => Some(crate::err!(
                    "worker for queue `{queue}` terminated unexpectedly: {join_err}"
                )),
            };

            if let Some(err) = failure {
                tracing::error!(
                    target: "refresher::runtime",
                    event = "worker_failed",
                    queue = %queue,
                    error = %err
                );
                self.update_health(WorkerHealth::Degraded {
                    reason: err.to_string(),
                });
                self.shutdown.cancel();
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                self.update_health(WorkerHealth::Shutdown);
                Ok(())
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use crate::envelope::Message;
    use crate::pipeline::{Pipeline, PipelineRegistry};
    use crate::topology::{QueueDefinition, Topology};
    use crate::transport::memory::MemoryBroker;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    struct Drain;

    #[async_trait]
    impl Pipeline for Drain {
        type Payload = JsonValue;

        fn name(&self) -> &'static str {
            "drain"
        }

        async fn process(&self, batch: Vec<Message<JsonValue>>) -> crate::Result<()> {
            for message in &batch {
                message.ack().await?;
            }
            Ok(())
        }
    }

    #[test]
    fn starting_without_workers_fails() {
        let mut runtime = WorkerRuntime::new(CancellationToken::new());
        assert!(runtime.start().is_err());
        assert_eq!(runtime.health(), WorkerHealth::Idle);
    }

    #[tokio::test]
    async fn health_follows_the_worker_lifecycle() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(Arc::new(broker.clone()), ConnectionOptions::default());
        connection.connect().await.expect("connect");
        let topology = Topology::new(&connection, vec![QueueDefinition::new("apps")], "failed");
        topology.declare_all().await.expect("declare");

        let mut pipelines = PipelineRegistry::new();
        pipelines.register("apps", Drain).expect("register");

        let shutdown = CancellationToken::new();
        let mut runtime = WorkerRuntime::new(shutdown.clone());
        runtime.add(BatchConsumer::new(
            topology.queue("apps").expect("queue"),
            topology.routes("apps").expect("routes"),
            pipelines.get("apps").expect("pipeline"),
        ));
        assert_eq!(runtime.worker_count(), 1);

        runtime.start().expect("start");
        assert_eq!(runtime.health(), WorkerHealth::Running);

        runtime.shutdown();
        runtime.wait().await.expect("clean stop");
        assert_eq!(runtime.health(), WorkerHealth::Shutdown);
        connection.close().await;
    }
}
