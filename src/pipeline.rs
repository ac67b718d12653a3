//! Worker pipeline contract.
//!
//! A pipeline receives a decoded batch from one queue and must apply exactly one terminal
//! action (`ack`, `retry` or `fail`) to every message. [`policy`] holds the attempt and
//! outcome conventions pipelines share.

use crate::envelope::{Message, MessageHandle};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::queue_event;
use crate::ratelimit::Limiter;
use crate::retry::{retry_with_backoff, BoundedRetry};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod app_players;
pub mod changes;
pub mod policy;

pub use policy::{action_failed, Outcome, RetryPolicy};

/// Store write failures as seen by pipelines.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Uniqueness violation: the row already exists.
    #[error("duplicate entry: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// External API failures as seen by pipelines.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    /// Network, timeout or 5xx-style failures worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExternalError::Transient(_))
    }
}

#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Processes a batch. Every message must receive a terminal action before this returns;
    /// anything left unsettled is failed by the consumer and counted as a leak. Returning a
    /// disconnect [`BrokerError`](crate::transport::BrokerError) hands the unsettled rest back
    /// to the broker instead.
    async fn process(&self, batch: Vec<Message<Self::Payload>>) -> Result<()>;
}

/// Publishes a downstream notification without dedup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: &str, payload: JsonValue) -> Result<()>;
}

/// Type-erased pipeline working on undecoded handles.
#[async_trait]
pub trait DynPipeline: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, handles: Vec<MessageHandle>) -> Result<()>;
}

struct Decoding<P>(P);

#[async_trait]
impl<P> DynPipeline for Decoding<P>
where
    P: Pipeline,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn dispatch(&self, handles: Vec<MessageHandle>) -> Result<()> {
        let mut batch = Vec::with_capacity(handles.len());
        for handle in handles {
            match serde_json::from_slice::<P::Payload>(handle.body()) {
                Ok(payload) => batch.push(Message::new(payload, handle)),
                Err(err) => {
                    metrics().inc_dropped();
                    queue_event!(
                        warn,
                        "refresher::pipeline",
                        "malformed_payload",
                        queue = handle.queue(),
                        delivery_tag = handle.delivery_tag(),
                        pipeline = self.0.name(),
                        error = err
                    );
                    if let Err(err) = handle.ack().await {
                        queue_event!(
                            warn,
                            "refresher::pipeline",
                            "drop_ack_failed",
                            queue = handle.queue(),
                            delivery_tag = handle.delivery_tag(),
                            error = err
                        );
                    }
                }
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.0.process(batch).await
    }
}

/// Maps queue names to the pipeline that consumes them. Resolved once at startup.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<dyn DynPipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&mut self, queue: impl Into<String>, pipeline: P) -> Result<()>
    where
        P: Pipeline,
    {
        let queue = queue.into();
        if self.pipelines.contains_key(&queue) {
            return Err(Error::msg(format!(
                "a pipeline is already registered for queue `{queue}`"
            )));
        }
        self.pipelines.insert(queue, Arc::new(Decoding(pipeline)));
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn DynPipeline>> {
        self.pipelines.get(queue).cloned()
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Calls an external service behind `limiter`, retrying transient failures within `policy`.
/// Each attempt waits for its own token.
pub async fn call_external<T, F, Fut>(
    limiter: &Limiter,
    policy: &BoundedRetry,
    shutdown: &CancellationToken,
    mut call: F,
) -> std::result::Result<T, ExternalError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, ExternalError>>,
{
    retry_with_backoff(
        policy,
        shutdown,
        |attempt| {
            let request = call(attempt);
            async move {
                limiter.wait().await;
                request.await
            }
        },
        ExternalError::is_transient,
    )
    .await
}
