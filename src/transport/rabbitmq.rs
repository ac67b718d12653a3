#![forbid(unsafe_code)]

use crate::transport::{
    BrokerChannel, BrokerDriver, BrokerError, BrokerSession, DeliveryStream, Headers,
    QueueArguments, QueueDeclaration, RawDelivery,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use tokio_executor_trait::Tokio as TokioExecutor;
use tokio_util::sync::CancellationToken;

const PERSISTENT: u8 = 2;

/// Connects to RabbitMQ over AMQP 0.9.1 via lapin.
pub struct RabbitmqDriver {
    url: String,
}

impl RabbitmqDriver {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerDriver for RabbitmqDriver {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let properties = ConnectionProperties::default().with_executor(TokioExecutor::current());
        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let closed = CancellationToken::new();
        let signal = closed.clone();
        connection.on_error(move |err| {
            tracing::warn!(
                target: "refresher::rabbitmq",
                event = "connection_error",
                error = %err
            );
            signal.cancel();
        });

        Ok(Arc::new(RabbitmqSession { connection, closed }))
    }
}

struct RabbitmqSession {
    connection: Connection,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerSession for RabbitmqSession {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Channel(format!("failed to open channel: {err}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                BrokerError::Channel(format!("failed to enable publisher confirms: {err}"))
            })?;

        Ok(Arc::new(RabbitmqChannel { channel }))
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|err| BrokerError::Connect(format!("close failed: {err}")))
    }
}

struct RabbitmqChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitmqChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                BrokerError::Channel(format!(
                    "failed to configure prefetch (prefetch={prefetch}): {err}"
                ))
            })
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: declaration.durable,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(
                &declaration.name,
                options,
                queue_arguments_table(&declaration.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::Declare {
                queue: declaration.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            queue: queue.to_string(),
            reason,
        };

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_headers(json_to_field_table(headers).map_err(publish_error)?);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|err| publish_error(format!("basic_publish failed: {err}")))?;

        match confirm
            .await
            .map_err(|err| publish_error(format!("publisher confirm failed: {err}")))?
        {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(publish_error(
                "publisher confirm returned nack".to_string(),
            )),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Consume {
                queue: queue.to_string(),
                reason: err.to_string(),
            })?;

        Ok(Box::new(RabbitmqDeliveryStream {
            queue: queue.to_string(),
            consumer,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::Settle {
                delivery_tag,
                reason: format!("ack failed: {err}"),
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };

        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|err| BrokerError::Settle {
                delivery_tag,
                reason: format!("nack failed: {err}"),
            })
    }
}

struct RabbitmqDeliveryStream {
    queue: String,
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for RabbitmqDeliveryStream {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>, BrokerError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(convert_delivery(delivery))),
            Some(Err(err)) => Err(BrokerError::Consume {
                queue: self.queue.clone(),
                reason: err.to_string(),
            }),
            None => Ok(None),
        }
    }
}

fn convert_delivery(delivery: Delivery) -> RawDelivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(field_table_to_json)
        .unwrap_or_default();

    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        body: delivery.data,
    }
}

/// Delay queues are plain queues whose messages expire into their origin through the
/// default exchange.
fn queue_arguments_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl) = arguments.message_ttl {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        table.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(millis),
        );
    }
    if let Some(target) = &arguments.dead_letter_to {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(String::new())),
        );
        table.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(target.clone())),
        );
    }
    table
}

fn field_table_to_json(table: &FieldTable) -> JsonMap<String, JsonValue> {
    table
        .into_iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

/// Envelope headers are integers and strings; other foreign header types surface as null
/// and are rejected by envelope parsing if they matter.
fn amqp_value_to_json(value: &AMQPValue) -> JsonValue {
    match value {
        AMQPValue::Boolean(flag) => JsonValue::Bool(*flag),
        AMQPValue::ShortShortInt(v) => JsonValue::from(*v),
        AMQPValue::ShortShortUInt(v) => JsonValue::from(*v),
        AMQPValue::ShortInt(v) => JsonValue::from(*v),
        AMQPValue::ShortUInt(v) => JsonValue::from(*v),
        AMQPValue::LongInt(v) => JsonValue::from(*v),
        AMQPValue::LongUInt(v) => JsonValue::from(*v),
        AMQPValue::LongLongInt(v) => JsonValue::from(*v),
        AMQPValue::Timestamp(v) => JsonValue::from(*v),
        AMQPValue::ShortString(text) => JsonValue::String(text.to_string()),
        AMQPValue::LongString(text) => {
            JsonValue::String(String::from_utf8_lossy(text.as_bytes()).into())
        }
        _ => JsonValue::Null,
    }
}

fn json_to_field_table(headers: &Headers) -> Result<FieldTable, String> {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            JsonValue::Null => AMQPValue::Void,
            JsonValue::Bool(flag) => AMQPValue::Boolean(*flag),
            JsonValue::Number(num) => num
                .as_i64()
                .map(AMQPValue::LongLongInt)
                .ok_or_else(|| format!("header `{key}` is not a 64-bit integer: {num}"))?,
            JsonValue::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
            other => return Err(format!("header `{key}` has unsupported value {other}")),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn delay_queue_arguments_route_back_to_origin() {
        let table = queue_arguments_table(&QueueArguments {
            message_ttl: Some(Duration::from_secs(60)),
            dead_letter_to: Some("apps".to_string()),
        });
        let json = field_table_to_json(&table);

        assert_eq!(json.get("x-message-ttl"), Some(&json!(60_000)));
        assert_eq!(json.get("x-dead-letter-exchange"), Some(&json!("")));
        assert_eq!(json.get("x-dead-letter-routing-key"), Some(&json!("apps")));
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        let table = queue_arguments_table(&QueueArguments::default());
        assert!(field_table_to_json(&table).is_empty());
    }

    #[test]
    fn envelope_headers_survive_field_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("attempt".to_string(), json!(2));
        headers.insert("first-queue".to_string(), json!("apps"));
        headers.insert("first-seen".to_string(), json!(1_700_000_000_000_i64));

        let table = json_to_field_table(&headers).expect("convert");
        assert_eq!(field_table_to_json(&table), headers);
    }

    #[test]
    fn structured_header_values_are_rejected() {
        let mut headers = Headers::new();
        headers.insert("trace".to_string(), json!({ "id": 1 }));
        assert!(json_to_field_table(&headers).is_err());
    }
}
