//! Broker abstraction shared by the AMQP driver and the in-process broker.

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
pub mod runtime;

/// Message headers as carried on the wire.
pub type Headers = JsonMap<String, JsonValue>;

/// Broker-side queue arguments used to build delay queues.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// Messages expire after this long in the queue.
    pub message_ttl: Option<Duration>,
    /// Expired or rejected messages are routed to this queue.
    pub dead_letter_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait BrokerDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves once the broker has closed this session.
    async fn closed(&self);

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// `false` once the session that owns this channel is gone.
    fn is_open(&self) -> bool;

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers)
        -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// `Ok(None)` means the subscription ended without an error.
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, BrokerError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("failed to declare queue `{queue}`: {reason}")]
    Declare { queue: String, reason: String },
    #[error("failed to publish to `{queue}`: {reason}")]
    Publish { queue: String, reason: String },
    #[error("failed to consume from `{queue}`: {reason}")]
    Consume { queue: String, reason: String },
    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },
    #[error("publish to `{queue}` timed out")]
    Timeout { queue: String },
    #[error("connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether the error came from losing the connection rather than a rejected operation.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrokerError::Closed | BrokerError::Connect(_))
    }
}
