//! Drives one queue: decodes each batch and hands it to the registered pipeline.
//!
//! The consumer applies no default policy of its own except the fallback: any message
//! still unsettled when the pipeline returns, errors or panics is failed to the dead queue
//! and counted as a leak. Lost connections are the exception: those deliveries go back to
//! the broker instead.

use crate::envelope::{ActionRoutes, Envelope, MessageHandle};
use crate::error::Error;
use crate::metrics::metrics;
use crate::pipeline::DynPipeline;
use crate::queue::{BatchHandler, Queue};
use crate::queue_event;
use crate::transport::{BrokerChannel, BrokerError, RawDelivery};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct BatchConsumer {
    queue: Arc<Queue>,
    dispatcher: Dispatcher,
}

impl BatchConsumer {
    pub fn new(queue: Arc<Queue>, routes: ActionRoutes, pipeline: Arc<dyn DynPipeline>) -> Self {
        Self {
            queue,
            dispatcher: Dispatcher { routes, pipeline },
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn pipeline_name(&self) -> &'static str {
        self.dispatcher.pipeline.name()
    }

    /// Consumes until `shutdown` fires. An in-flight batch always runs to completion.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        queue_event!(
            info,
            "refresher::consumer",
            "starting",
            queue = self.queue.name(),
            pipeline = self.dispatcher.pipeline.name()
        );
        let result = self.queue.consume(&mut self.dispatcher, &shutdown).await;
        queue_event!(
            info,
            "refresher::consumer",
            "stopped",
            queue = self.queue.name()
        );
        result
    }
}

struct Dispatcher {
    routes: ActionRoutes,
    pipeline: Arc<dyn DynPipeline>,
}

impl Dispatcher {
    async fn decode(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        batch: Vec<RawDelivery>,
    ) -> Vec<MessageHandle> {
        let queue = self.routes.origin.as_str();
        let mut handles = Vec::with_capacity(batch.len());

        for delivery in batch {
            match Envelope::from_headers(&delivery.headers, queue) {
                Ok(envelope) => handles.push(MessageHandle::new(
                    delivery,
                    envelope.observed(queue),
                    channel.clone(),
                    self.routes.clone(),
                )),
                Err(err) => {
                    metrics().inc_dropped();
                    queue_event!(
                        warn,
                        "refresher::consumer",
                        "malformed_envelope",
                        queue = queue,
                        delivery_tag = delivery.delivery_tag,
                        error = err
                    );
                    if let Err(err) = channel.ack(delivery.delivery_tag).await {
                        queue_event!(
                            warn,
                            "refresher::consumer",
                            "drop_ack_failed",
                            queue = queue,
                            delivery_tag = delivery.delivery_tag,
                            error = err
                        );
                    }
                }
            }
        }
        handles
    }

    /// Fails whatever the pipeline left unsettled. Deliveries whose channel has closed are
    /// left for the broker to redeliver; after a disconnect error they are requeued instead.
    async fn fail_unsettled(&self, handles: &[MessageHandle], disconnected: bool) {
        for handle in handles {
            if handle.action().await.is_some() {
                continue;
            }
            if !handle.channel_open() {
                queue_event!(
                    warn,
                    "refresher::consumer",
                    "left_for_redelivery",
                    queue = handle.queue(),
                    delivery_tag = handle.delivery_tag(),
                    pipeline = self.pipeline.name()
                );
                continue;
            }
            if disconnected {
                if let Err(err) = handle.requeue().await {
                    queue_event!(
                        warn,
                        "refresher::consumer",
                        "requeue_failed",
                        queue = handle.queue(),
                        delivery_tag = handle.delivery_tag(),
                        error = err
                    );
                }
                continue;
            }

            metrics().inc_leaked();
            queue_event!(
                error,
                "refresher::consumer",
                "unsettled_message",
                queue = handle.queue(),
                delivery_tag = handle.delivery_tag(),
                pipeline = self.pipeline.name(),
                attempt = handle.envelope().attempt
            );
            if let Err(err) = handle.fail().await {
                queue_event!(
                    warn,
                    "refresher::consumer",
                    "fallback_failed",
                    queue = handle.queue(),
                    delivery_tag = handle.delivery_tag(),
                    error = err
                );
            }
        }
    }
}

fn is_disconnect(err: &Error) -> bool {
    matches!(err.root(), Error::Broker(broker) if broker.is_disconnect())
}

#[async_trait]
impl BatchHandler for Dispatcher {
    async fn handle_batch(&mut self, channel: Arc<dyn BrokerChannel>, batch: Vec<RawDelivery>) {
        let handles = self.decode(&channel, batch).await;
        if handles.is_empty() {
            return;
        }

        let queue = self.routes.origin.clone();
        metrics().add_inflight(&queue, handles.len());

        let outcome = AssertUnwindSafe(self.pipeline.dispatch(handles.clone()))
            .catch_unwind()
            .await;
        let disconnected = matches!(&outcome, Ok(Err(err)) if is_disconnect(err));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                queue_event!(
                    warn,
                    "refresher::consumer",
                    "pipeline_error",
                    queue = queue,
                    pipeline = self.pipeline.name(),
                    batch = handles.len(),
                    error = err
                );
            }
            Err(panic) => {
                queue_event!(
                    error,
                    "refresher::consumer",
                    "pipeline_panicked",
                    queue = queue,
                    pipeline = self.pipeline.name(),
                    batch = handles.len(),
                    panic = panic_message(panic.as_ref())
                );
            }
        }

        self.fail_unsettled(&handles, disconnected).await;
        metrics().sub_inflight(&queue, handles.len());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
