use crate::envelope::{Message, MessageAction};
use crate::pipeline::{ExternalError, StoreError};
use crate::queue_event;
use crate::transport::BrokerError;

/// How a unit of work ended, before it is mapped onto a terminal action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Entity gone, malformed or otherwise not worth retrying.
    Permanent,
    /// Infrastructure or network failure.
    Transient,
}

impl From<&StoreError> for Outcome {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Duplicate(_) => Outcome::Done,
            StoreError::Unavailable(_) => Outcome::Transient,
            StoreError::NotFound(_) | StoreError::Invalid(_) => Outcome::Permanent,
        }
    }
}

impl From<&ExternalError> for Outcome {
    fn from(err: &ExternalError) -> Self {
        if err.is_transient() {
            Outcome::Transient
        } else {
            Outcome::Permanent
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    pub fn decide(&self, attempt: u32, outcome: Outcome) -> MessageAction {
        match outcome {
            Outcome::Done | Outcome::Permanent => MessageAction::Ack,
            Outcome::Transient if self.exhausted(attempt) => MessageAction::Fail,
            Outcome::Transient => MessageAction::Retry,
        }
    }

    /// Fails messages past their attempt budget. Returns `true` if the message should be
    /// processed.
    pub async fn admit<P>(&self, message: &Message<P>) -> Result<bool, BrokerError> {
        if !self.exhausted(message.attempt()) {
            return Ok(true);
        }
        queue_event!(
            warn,
            "refresher::pipeline",
            "attempts_exhausted",
            queue = message.handle().queue(),
            delivery_tag = message.handle().delivery_tag(),
            attempt = message.attempt(),
            max_attempts = self.max_attempts
        );
        message.fail().await?;
        Ok(false)
    }

    /// Applies the action `decide` picks for `outcome`.
    pub async fn settle<P>(
        &self,
        message: &Message<P>,
        outcome: Outcome,
    ) -> Result<MessageAction, BrokerError> {
        let action = self.decide(message.attempt(), outcome);
        match action {
            MessageAction::Ack => message.ack().await?,
            MessageAction::Retry => message.retry().await?,
            MessageAction::Fail => message.fail().await?,
        };
        Ok(action)
    }
}

/// Logs a terminal action the broker did not complete. The delivery stays with the broker,
/// so the rest of the batch carries on.
pub fn action_failed<P>(message: &Message<P>, err: &BrokerError) {
    queue_event!(
        warn,
        "refresher::pipeline",
        "action_failed",
        queue = message.handle().queue(),
        delivery_tag = message.handle().delivery_tag(),
        attempt = message.attempt(),
        error = err
    );
}
