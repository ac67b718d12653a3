use crate::config::{DedupConfig, RefresherConfig};
use crate::connection::Connection;
use crate::consumer::BatchConsumer;
use crate::dedup::{DedupGuard, DedupStore, MemoryDedupStore};
use crate::error::{Context, Error, Result};
use crate::metrics::metrics;
use crate::pipeline::{Pipeline, PipelineRegistry, RetryPolicy};
use crate::producer::Producer;
use crate::ratelimit::RateLimiterRegistry;
use crate::runtime::WorkerRuntime;
use crate::topology::Topology;
use crate::transport::memory::MemoryBroker;
use crate::transport::BrokerDriver;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires the connection, topology, dedup guard, limiter registry and registered pipelines
/// into one process.
pub struct RefresherApp {
    config: RefresherConfig,
    connection: Connection,
    topology: Arc<Topology>,
    producer: Producer,
    limiters: Arc<RateLimiterRegistry>,
    memory_dedup: Option<Arc<MemoryDedupStore>>,
    pipelines: PipelineRegistry,
    shutdown: CancellationToken,
    drain_timeout: Duration,
}

impl RefresherApp {
    /// Connects to the broker named by `broker.url` and declares every configured queue.
    pub async fn initialise(config: RefresherConfig) -> Result<Self> {
        let driver = broker_driver(&config)?;
        Self::with_driver(config, driver).await
    }

    pub async fn with_driver(config: RefresherConfig, driver: Arc<dyn BrokerDriver>) -> Result<Self> {
        config.validate()?;

        let connection = Connection::new(driver, config.broker.connection_options());
        connection
            .connect()
            .await
            .context("failed to connect to broker")?;

        let topology = Arc::new(Topology::new(
            &connection,
            config.queue_definitions(),
            &config.dead_queue,
        ));
        topology
            .declare_all()
            .await
            .context("failed to declare queues")?;

        let (store, memory_dedup) = dedup_store(&config.dedup).await?;
        tracing::info!(
            target: "refresher::app",
            event = "initialised",
            broker = connection.driver_name(),
            dedup = store.name(),
            queues = config.queues.len()
        );
        let dedup = DedupGuard::new(store, config.dedup.key_prefix.clone(), config.dedup.ttl);
        let producer = Producer::new(topology.clone(), dedup);
        let limiters = Arc::new(config.rate_limits.registry());

        Ok(Self {
            config,
            connection,
            topology,
            producer,
            limiters,
            memory_dedup,
            pipelines: PipelineRegistry::new(),
            shutdown: CancellationToken::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn config(&self) -> &RefresherConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.clone()
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn limiters(&self) -> Arc<RateLimiterRegistry> {
        self.limiters.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Attempt budget configured for `queue`.
    pub fn retry_policy(&self, queue: &str) -> RetryPolicy {
        self.topology
            .definition(queue)
            .map(|definition| RetryPolicy::new(definition.max_attempts))
            .unwrap_or_default()
    }

    pub fn register<P>(&mut self, queue: &str, pipeline: P) -> Result<()>
    where
        P: Pipeline,
    {
        if self.topology.queue(queue).is_none() {
            return Err(Error::UnknownQueue(queue.to_string()));
        }
        self.pipelines.register(queue, pipeline)
    }

    /// Runs one consumer per registered pipeline until Ctrl+C, the shutdown token, or a
    /// worker failure, then drains in-flight batches and closes the connection.
    pub async fn run(self) -> Result<()> {
        let Self {
            connection,
            topology,
            limiters,
            memory_dedup,
            pipelines,
            shutdown,
            drain_timeout,
            config,
            ..
        } = self;

        let mut runtime = WorkerRuntime::new(shutdown.clone());
        for queue in pipelines.queues() {
            let (Some(work), Some(routes), Some(pipeline)) = (
                topology.queue(queue),
                topology.routes(queue),
                pipelines.get(queue),
            ) else {
                return Err(Error::UnknownQueue(queue.to_string()));
            };
            runtime.add(BatchConsumer::new(work, routes, pipeline));
        }
        runtime.start()?;

        let mut sweepers = vec![limiters.spawn_sweeper(config.rate_limits.sweep_interval, shutdown.clone())];
        if let Some(store) = memory_dedup.as_ref() {
            sweepers.push(store.spawn_sweeper(config.dedup.sweep_interval, shutdown.clone()));
        }

        tracing::info!(
            target: "refresher::app",
            event = "ready",
            workers = runtime.worker_count()
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "refresher::app", event = "shutdown_signal");
            }
            _ = shutdown.cancelled() => {}
        }

        shutdown.cancel();
        let drained = timeout(drain_timeout, async {
            let result = runtime.wait().await;
            for sweeper in sweepers {
                if let Err(err) = sweeper.await {
                    tracing::error!(
                        target: "refresher::app",
                        event = "sweeper_failed",
                        error = %err
                    );
                }
            }
            result
        })
        .await;

        let outcome = match drained {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    target: "refresher::app",
                    event = "drain_timeout",
                    timeout_secs = drain_timeout.as_secs_f64()
                );
                Err(crate::err!(
                    "graceful shutdown timed out after {:?}",
                    drain_timeout
                ))
            }
        };

        let counters = metrics().snapshot();
        tracing::info!(
            target: "refresher::app",
            event = "stopped",
            published = counters.published,
            acked = counters.acked,
            retried = counters.retried,
            failed = counters.failed,
            leaked = counters.leaked,
            dropped = counters.dropped,
            reconnects = counters.reconnects
        );
        connection.close().await;
        outcome
    }

    /// Stops consumers and closes the connection without running.
    pub async fn close(self) {
        self.shutdown.cancel();
        self.connection.close().await;
    }
}

fn broker_driver(config: &RefresherConfig) -> Result<Arc<dyn BrokerDriver>> {
    if config.broker.is_memory() {
        return Ok(Arc::new(MemoryBroker::new()));
    }

    #[cfg(feature = "rabbitmq")]
    {
        Ok(Arc::new(crate::transport::rabbitmq::RabbitmqDriver::new(
            config.broker.url.clone(),
        )))
    }

    #[cfg(not(feature = "rabbitmq"))]
    {
        Err(crate::err!(
            "broker url `{}` needs the `rabbitmq` feature",
            config.broker.url
        ))
    }
}

async fn dedup_store(
    config: &DedupConfig,
) -> Result<(Arc<dyn DedupStore>, Option<Arc<MemoryDedupStore>>)> {
    match config.url.as_deref() {
        None => {
            let store = Arc::new(MemoryDedupStore::new());
            Ok((store.clone(), Some(store)))
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = crate::dedup::RedisDedupStore::connect(url)
                .await
                .context("failed to connect to dedup store")?;
            Ok((Arc::new(store), None))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(crate::err!("dedup.url needs the `redis` feature")),
    }
}
