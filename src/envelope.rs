//! Message metadata carried in broker headers and the per-delivery action guard.

use crate::metrics::metrics;
use crate::queue::Queue;
use crate::queue_event;
use crate::transport::{BrokerChannel, BrokerError, Headers, RawDelivery};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub const ATTEMPT_HEADER: &str = "attempt";
pub const FIRST_SEEN_HEADER: &str = "first-seen";
pub const LAST_SEEN_HEADER: &str = "last-seen";
pub const FIRST_QUEUE_HEADER: &str = "first-queue";
pub const LAST_QUEUE_HEADER: &str = "last-queue";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("header `{header}` is invalid: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },
    #[error("payload could not be decoded: {0}")]
    Payload(String),
}

/// Delivery metadata. Timestamps have millisecond precision, matching the wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub attempt: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub first_queue: String,
    pub last_queue: String,
}

impl Envelope {
    /// Metadata for a message published for the first time.
    pub fn new(queue: &str) -> Self {
        let now = now_millis();
        Self {
            attempt: 1,
            first_seen: now,
            last_seen: now,
            first_queue: queue.to_string(),
            last_queue: queue.to_string(),
        }
    }

    /// Reads the envelope of a delivery on `queue`. Messages from producers that set no
    /// headers are treated as first attempts first seen now.
    pub fn from_headers(headers: &Headers, queue: &str) -> Result<Self, EnvelopeError> {
        let fresh = Self::new(queue);

        let attempt = match headers.get(ATTEMPT_HEADER) {
            Some(value) => {
                let attempt = integer_header(ATTEMPT_HEADER, value)?;
                u32::try_from(attempt)
                    .ok()
                    .filter(|attempt| *attempt >= 1)
                    .ok_or_else(|| EnvelopeError::InvalidHeader {
                        header: ATTEMPT_HEADER,
                        reason: format!("attempt must be a positive integer, got {attempt}"),
                    })?
            }
            None => 1,
        };

        let first_seen = timestamp_header(FIRST_SEEN_HEADER, headers)?.unwrap_or(fresh.first_seen);
        let last_seen = timestamp_header(LAST_SEEN_HEADER, headers)?.unwrap_or(first_seen);
        let first_queue = string_header(FIRST_QUEUE_HEADER, headers)?.unwrap_or(fresh.first_queue);
        let last_queue = string_header(LAST_QUEUE_HEADER, headers)?.unwrap_or(fresh.last_queue);

        Ok(Self {
            attempt,
            first_seen,
            last_seen,
            first_queue,
            last_queue,
        })
    }

    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(ATTEMPT_HEADER.to_string(), JsonValue::from(self.attempt));
        headers.insert(
            FIRST_SEEN_HEADER.to_string(),
            JsonValue::from(self.first_seen.timestamp_millis()),
        );
        headers.insert(
            LAST_SEEN_HEADER.to_string(),
            JsonValue::from(self.last_seen.timestamp_millis()),
        );
        headers.insert(
            FIRST_QUEUE_HEADER.to_string(),
            JsonValue::from(self.first_queue.clone()),
        );
        headers.insert(
            LAST_QUEUE_HEADER.to_string(),
            JsonValue::from(self.last_queue.clone()),
        );
        headers
    }

    /// Stamps a delivery observed on `queue`.
    pub fn observed(mut self, queue: &str) -> Self {
        self.last_seen = now_millis();
        self.last_queue = queue.to_string();
        self
    }

    /// Envelope for republishing after a failed attempt on `queue`.
    pub fn next_attempt(&self, queue: &str) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            first_seen: self.first_seen,
            last_seen: now_millis(),
            first_queue: self.first_queue.clone(),
            last_queue: queue.to_string(),
        }
    }
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

fn integer_header(header: &'static str, value: &JsonValue) -> Result<i64, EnvelopeError> {
    let parsed = match value {
        JsonValue::Number(number) => number.as_i64(),
        JsonValue::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| EnvelopeError::InvalidHeader {
        header,
        reason: format!("expected an integer, got {value}"),
    })
}

fn timestamp_header(
    header: &'static str,
    headers: &Headers,
) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    let Some(value) = headers.get(header) else {
        return Ok(None);
    };
    let millis = integer_header(header, value)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| EnvelopeError::InvalidHeader {
            header,
            reason: format!("timestamp {millis} is out of range"),
        })
}

fn string_header(header: &'static str, headers: &Headers) -> Result<Option<String>, EnvelopeError> {
    match headers.get(header) {
        None => Ok(None),
        Some(JsonValue::String(text)) => Ok(Some(text.clone())),
        Some(other) => Err(EnvelopeError::InvalidHeader {
            header,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageAction {
    Ack,
    Retry,
    Fail,
}

impl fmt::Display for MessageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageAction::Ack => "ack",
            MessageAction::Retry => "retry",
            MessageAction::Fail => "fail",
        };
        f.write_str(label)
    }
}

/// Where retried and failed messages of one origin queue are republished.
#[derive(Clone)]
pub struct ActionRoutes {
    pub origin: String,
    pub delay: Arc<Queue>,
    pub dead: Arc<Queue>,
}

/// Terminal-action handle for one delivered message.
///
/// `ack`, `retry` and `fail` share one lock. The first call records its action before
/// touching the broker; every later call, concurrent or not, returns `Ok(false)` without
/// side effects. If the republish or ack fails after the action is recorded, the original
/// delivery stays unacked and the broker redelivers it once the channel is gone. An action
/// requested after the channel has closed is recorded but never republished.
#[derive(Clone)]
pub struct MessageHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    delivery_tag: u64,
    body: Vec<u8>,
    envelope: Envelope,
    channel: Arc<dyn BrokerChannel>,
    routes: ActionRoutes,
    action: Mutex<Option<MessageAction>>,
}

impl MessageHandle {
    pub fn new(
        delivery: RawDelivery,
        envelope: Envelope,
        channel: Arc<dyn BrokerChannel>,
        routes: ActionRoutes,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                delivery_tag: delivery.delivery_tag,
                body: delivery.body,
                envelope,
                channel,
                routes,
                action: Mutex::new(None),
            }),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    pub fn queue(&self) -> &str {
        &self.inner.routes.origin
    }

    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Whether the channel this message arrived on can still settle it.
    pub fn channel_open(&self) -> bool {
        self.inner.channel.is_open()
    }

    /// The action applied so far, if any.
    pub async fn action(&self) -> Option<MessageAction> {
        *self.inner.action.lock().await
    }

    pub async fn ack(&self) -> Result<bool, BrokerError> {
        self.settle(MessageAction::Ack).await
    }

    pub async fn retry(&self) -> Result<bool, BrokerError> {
        self.settle(MessageAction::Retry).await
    }

    pub async fn fail(&self) -> Result<bool, BrokerError> {
        self.settle(MessageAction::Fail).await
    }

    /// Hands an unsettled delivery back to its queue without recording an action.
    pub(crate) async fn requeue(&self) -> Result<bool, BrokerError> {
        let inner = &self.inner;
        let applied = inner.action.lock().await;
        if applied.is_some() {
            return Ok(false);
        }
        inner.channel.nack(inner.delivery_tag, true).await?;
        Ok(true)
    }

    async fn settle(&self, action: MessageAction) -> Result<bool, BrokerError> {
        let inner = &self.inner;
        let mut applied = inner.action.lock().await;
        if let Some(existing) = *applied {
            queue_event!(
                debug,
                "refresher::envelope",
                "action_ignored",
                queue = inner.routes.origin,
                delivery_tag = inner.delivery_tag,
                requested = action,
                applied = existing
            );
            return Ok(false);
        }
        *applied = Some(action);

        if !inner.channel.is_open() {
            queue_event!(
                warn,
                "refresher::envelope",
                "channel_closed",
                queue = inner.routes.origin,
                delivery_tag = inner.delivery_tag,
                requested = action
            );
            return Err(BrokerError::Closed);
        }

        match action {
            MessageAction::Ack => {}
            MessageAction::Retry => {
                let next = inner.envelope.next_attempt(&inner.routes.origin);
                inner.routes.delay.publish(&inner.body, &next).await?;
            }
            MessageAction::Fail => {
                let dead = inner.envelope.clone().observed(&inner.routes.origin);
                inner.routes.dead.publish(&inner.body, &dead).await?;
            }
        }
        inner.channel.ack(inner.delivery_tag).await?;

        match action {
            MessageAction::Ack => metrics().inc_acked(),
            MessageAction::Retry => metrics().inc_retried(),
            MessageAction::Fail => metrics().inc_failed(),
        }
        queue_event!(
            debug,
            "refresher::envelope",
            "settled",
            queue = inner.routes.origin,
            delivery_tag = inner.delivery_tag,
            action = action,
            attempt = inner.envelope.attempt
        );
        Ok(true)
    }
}

/// A decoded message handed to a pipeline.
pub struct Message<P> {
    payload: P,
    handle: MessageHandle,
}

impl<P> Message<P> {
    pub fn new(payload: P, handle: MessageHandle) -> Self {
        Self { payload, handle }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn envelope(&self) -> &Envelope {
        self.handle.envelope()
    }

    pub fn attempt(&self) -> u32 {
        self.handle.envelope().attempt
    }

    pub fn handle(&self) -> &MessageHandle {
        &self.handle
    }

    pub async fn ack(&self) -> Result<bool, BrokerError> {
        self.handle.ack().await
    }

    pub async fn retry(&self) -> Result<bool, BrokerError> {
        self.handle.retry().await
    }

    pub async fn fail(&self) -> Result<bool, BrokerError> {
        self.handle.fail().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn headers_round_trip_with_millisecond_precision() {
        let envelope = Envelope::new("apps").next_attempt("apps");
        let parsed = Envelope::from_headers(&envelope.to_headers(), "apps").expect("parse");
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn missing_headers_mean_first_attempt() {
        let envelope = Envelope::from_headers(&Headers::new(), "players").expect("parse");
        assert_eq!(envelope.attempt, 1);
        assert_eq!(envelope.first_queue, "players");
        assert_eq!(envelope.first_seen, envelope.last_seen);
    }

    #[test]
    fn string_encoded_attempt_is_accepted() {
        let mut headers = Headers::new();
        headers.insert(ATTEMPT_HEADER.to_string(), json!("3"));
        let envelope = Envelope::from_headers(&headers, "apps").expect("parse");
        assert_eq!(envelope.attempt, 3);
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let mut headers = Headers::new();
        headers.insert(ATTEMPT_HEADER.to_string(), json!(0));
        assert!(matches!(
            Envelope::from_headers(&headers, "apps"),
            Err(EnvelopeError::InvalidHeader { header: ATTEMPT_HEADER, .. })
        ));

        let mut headers = Headers::new();
        headers.insert(FIRST_QUEUE_HEADER.to_string(), json!(7));
        assert!(Envelope::from_headers(&headers, "apps").is_err());

        let mut headers = Headers::new();
        headers.insert(FIRST_SEEN_HEADER.to_string(), json!("yesterday"));
        assert!(Envelope::from_headers(&headers, "apps").is_err());
    }

    #[test]
    fn next_attempt_preserves_first_seen() {
        let first = Envelope::new("apps");
        let second = first.next_attempt("apps");
        assert_eq!(second.attempt, 2);
        assert_eq!(second.first_seen, first.first_seen);
        assert_eq!(second.first_queue, "apps");
        assert!(second.last_seen >= first.last_seen);
    }
}
