//! Named work queue bound to a [`Connection`].
//!
//! The queue lazily opens and declares its own channel and caches it per connection
//! generation, so a reconnect transparently re-declares on next use.

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::metrics::metrics;
use crate::queue_event;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::transport::runtime::{sleep_until_deadline, sleep_with_shutdown};
use crate::transport::{
    BrokerChannel, BrokerError, DeliveryStream, Headers, QueueArguments, QueueDeclaration,
    RawDelivery,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub durable: bool,
    /// Maximum unacked deliveries held by this queue's channel. `0` leaves it unbounded.
    pub prefetch: u16,
    pub batch_size: usize,
    /// Flush a partial batch this long after its first delivery. Zero disables the timer.
    pub batch_max_wait: Duration,
    pub arguments: QueueArguments,
    pub resubscribe: RetrySettings,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            prefetch: 10,
            batch_size: 10,
            batch_max_wait: Duration::ZERO,
            arguments: QueueArguments::default(),
            resubscribe: RetrySettings::new(Duration::from_secs(1), Duration::from_secs(30), 2.0),
        }
    }
}

/// Receives each accumulated batch together with the channel the deliveries arrived on.
#[async_trait]
pub trait BatchHandler: Send {
    async fn handle_batch(&mut self, channel: Arc<dyn BrokerChannel>, batch: Vec<RawDelivery>);
}

struct DeclaredChannel {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

enum SubscriptionEnd {
    Shutdown,
    StreamEnded,
}

pub struct Queue {
    name: String,
    options: QueueOptions,
    connection: Connection,
    channel: Mutex<Option<DeclaredChannel>>,
}

impl Queue {
    pub fn new(name: impl Into<String>, options: QueueOptions, connection: Connection) -> Self {
        Self {
            name: name.into(),
            options,
            connection,
            channel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            durable: self.options.durable,
            arguments: self.options.arguments.clone(),
        }
    }

    /// Opens the channel, applies prefetch and declares the queue. Repeated calls reuse the
    /// cached channel until the connection generation changes.
    pub async fn declare(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut cached = self.channel.lock().await;
        if let Some(declared) = cached.as_ref() {
            if declared.generation == self.connection.generation() {
                return Ok(declared.channel.clone());
            }
        }

        let (generation, channel) = self.connection.channel().await?;
        if self.options.prefetch > 0 {
            channel.set_prefetch(self.options.prefetch).await?;
        }
        channel.declare_queue(&self.declaration()).await?;

        queue_event!(
            info,
            "refresher::queue",
            "declared",
            queue = self.name,
            generation = generation,
            prefetch = self.options.prefetch
        );

        *cached = Some(DeclaredChannel {
            generation,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Drops the cached channel so the next operation re-declares.
    pub async fn invalidate(&self) {
        *self.channel.lock().await = None;
    }

    pub async fn publish(&self, body: &[u8], envelope: &Envelope) -> Result<(), BrokerError> {
        self.publish_with_headers(body, &envelope.to_headers()).await
    }

    pub async fn publish_with_headers(
        &self,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let result = self.try_publish(body, headers).await;
        match &result {
            Ok(()) => metrics().inc_published(),
            Err(err) => {
                metrics().inc_publish_failure();
                queue_event!(
                    warn,
                    "refresher::queue",
                    "publish_failed",
                    queue = self.name,
                    error = err
                );
                self.invalidate().await;
            }
        }
        result
    }

    async fn try_publish(&self, body: &[u8], headers: &Headers) -> Result<(), BrokerError> {
        let channel = self.declare().await?;
        match self.connection.publish_timeout() {
            Some(limit) => tokio::time::timeout(limit, channel.publish(&self.name, body, headers))
                .await
                .map_err(|_| BrokerError::Timeout {
                    queue: self.name.clone(),
                })?,
            None => channel.publish(&self.name, body, headers).await,
        }
    }

    /// Subscribes and feeds batches to `handler` until `shutdown` fires. Lost subscriptions
    /// are re-established with backoff once the connection is back.
    pub async fn consume<H>(
        &self,
        handler: &mut H,
        shutdown: &CancellationToken,
    ) -> Result<(), BrokerError>
    where
        H: BatchHandler + ?Sized,
    {
        let mut backoff = RetryBackoff::new(self.options.resubscribe.clone());

        loop {
            if shutdown.is_cancelled() || !self.connection.wait_connected(shutdown).await {
                return Ok(());
            }

            let failure = match self.subscribe_once(handler, shutdown, &mut backoff).await {
                Ok(SubscriptionEnd::Shutdown) => return Ok(()),
                Ok(SubscriptionEnd::StreamEnded) => "subscription ended".to_string(),
                Err(err) => err.to_string(),
            };

            self.invalidate().await;
            let delay = backoff.on_failure();
            queue_event!(
                warn,
                "refresher::queue",
                "resubscribe",
                queue = self.name,
                retry_in_ms = delay.as_millis() as u64,
                error = failure
            );
            if sleep_with_shutdown(delay, shutdown).await {
                return Ok(());
            }
        }
    }

    async fn subscribe_once<H>(
        &self,
        handler: &mut H,
        shutdown: &CancellationToken,
        backoff: &mut RetryBackoff,
    ) -> Result<SubscriptionEnd, BrokerError>
    where
        H: BatchHandler + ?Sized,
    {
        let channel = self.declare().await?;
        let consumer_tag = format!("refresher-{}-{}", self.name, Uuid::new_v4());
        let mut stream: Box<dyn DeliveryStream> = channel.consume(&self.name, &consumer_tag).await?;
        backoff.on_success();

        queue_event!(
            info,
            "refresher::queue",
            "subscribed",
            queue = self.name,
            consumer_tag = consumer_tag,
            batch_size = self.options.batch_size
        );

        let batch_size = self.options.batch_size.max(1);
        let max_wait = self.options.batch_max_wait;
        let mut buffer: Vec<RawDelivery> = Vec::with_capacity(batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.requeue(channel.as_ref(), &mut buffer).await;
                    return Ok(SubscriptionEnd::Shutdown);
                }
                _ = sleep_until_deadline(deadline) => {
                    deadline = None;
                    let batch = std::mem::take(&mut buffer);
                    handler.handle_batch(channel.clone(), batch).await;
                }
                next = stream.next_delivery() => match next {
                    Ok(Some(delivery)) => {
                        if buffer.is_empty() && !max_wait.is_zero() {
                            deadline = Some(Instant::now() + max_wait);
                        }
                        buffer.push(delivery);
                        if buffer.len() >= batch_size {
                            deadline = None;
                            let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                            handler.handle_batch(channel.clone(), batch).await;
                        }
                    }
                    Ok(None) => {
                        self.requeue(channel.as_ref(), &mut buffer).await;
                        return Ok(SubscriptionEnd::StreamEnded);
                    }
                    Err(err) => {
                        self.requeue(channel.as_ref(), &mut buffer).await;
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Returns buffered, undispatched deliveries to the broker.
    async fn requeue(&self, channel: &dyn BrokerChannel, buffer: &mut Vec<RawDelivery>) {
        for delivery in buffer.drain(..) {
            if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                queue_event!(
                    debug,
                    "refresher::queue",
                    "requeue_failed",
                    queue = self.name,
                    delivery_tag = delivery.delivery_tag,
                    error = err
                );
            }
        }
    }
}
