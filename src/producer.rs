//! Entry point for "please refresh entity X" requests.

use crate::dedup::{DedupGuard, DedupKey};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::pipeline::Notifier;
use crate::topology::Topology;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A request for the same entity is still within its dedup window.
    AlreadyQueued,
}

impl fmt::Display for EnqueueOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueOutcome::Queued => f.write_str("queued"),
            EnqueueOutcome::AlreadyQueued => f.write_str("already queued"),
        }
    }
}

#[derive(Clone)]
pub struct Producer {
    topology: Arc<Topology>,
    dedup: DedupGuard,
}

impl Producer {
    pub fn new(topology: Arc<Topology>, dedup: DedupGuard) -> Self {
        Self { topology, dedup }
    }

    /// Publishes a first-attempt message for `(kind, id)` on the queue named `kind`, unless
    /// the entity is already queued. Publish errors are returned as-is; nothing is retried here.
    pub async fn enqueue<P>(&self, kind: &str, id: impl fmt::Display, payload: &P) -> Result<EnqueueOutcome>
    where
        P: Serialize + ?Sized,
    {
        let queue = self
            .topology
            .queue(kind)
            .ok_or_else(|| Error::UnknownQueue(kind.to_string()))?;
        let body = serde_json::to_vec(payload)?;

        let key = DedupKey::new(kind, id);
        if !self.dedup.reserve(&key).await? {
            metrics().inc_dedup_rejected();
            tracing::debug!(
                target: "refresher::producer",
                event = "already_queued",
                queue = kind,
                key = %key
            );
            return Ok(EnqueueOutcome::AlreadyQueued);
        }

        queue.publish(&body, &Envelope::new(kind)).await?;
        tracing::debug!(
            target: "refresher::producer",
            event = "queued",
            queue = kind,
            key = %key
        );
        Ok(EnqueueOutcome::Queued)
    }

    /// Publishes without a dedup check, for fan-out from one pipeline to another.
    pub async fn notify<P>(&self, kind: &str, payload: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let queue = self
            .topology
            .queue(kind)
            .ok_or_else(|| Error::UnknownQueue(kind.to_string()))?;
        let body = serde_json::to_vec(payload)?;
        queue.publish(&body, &Envelope::new(kind)).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for Producer {
    async fn notify(&self, kind: &str, payload: JsonValue) -> Result<()> {
        Producer::notify(self, kind, &payload).await
    }
}
