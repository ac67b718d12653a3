//! Records catalogue change sets and fans the touched apps out downstream.

use crate::envelope::Message;
use crate::error::Result;
use crate::pipeline::{action_failed, Notifier, Outcome, Pipeline, RetryPolicy, StoreError};
use crate::queue_event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub change_number: u64,
    #[serde(default)]
    pub apps: Vec<u64>,
    #[serde(default)]
    pub packages: Vec<u64>,
}

/// Change numbers are unique; inserting one twice yields [`StoreError::Duplicate`].
#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn insert_change(&self, change: &ChangeRequest) -> std::result::Result<(), StoreError>;
}

pub struct ChangesPipeline {
    store: Arc<dyn ChangeStore>,
    notifier: Option<(Arc<dyn Notifier>, String)>,
    policy: RetryPolicy,
}

impl ChangesPipeline {
    pub fn new(store: Arc<dyn ChangeStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            notifier: None,
            policy,
        }
    }

    /// Publishes one notification per changed app to `queue` after a successful insert.
    pub fn notify_apps(mut self, notifier: Arc<dyn Notifier>, queue: impl Into<String>) -> Self {
        self.notifier = Some((notifier, queue.into()));
        self
    }

    async fn handle(&self, message: &Message<ChangeRequest>) -> Outcome {
        let change = message.payload();
        match self.store.insert_change(change).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                queue_event!(
                    debug,
                    "refresher::pipeline::changes",
                    "duplicate_change",
                    queue = message.handle().queue(),
                    change_number = change.change_number
                );
                return Outcome::Done;
            }
            Err(err) => {
                queue_event!(
                    warn,
                    "refresher::pipeline::changes",
                    "insert_failed",
                    queue = message.handle().queue(),
                    change_number = change.change_number,
                    error = err
                );
                return Outcome::from(&err);
            }
        }

        if let Some((notifier, queue)) = &self.notifier {
            for app in &change.apps {
                let payload = json!({ "app_id": app, "change_number": change.change_number });
                if let Err(err) = notifier.notify(queue, payload).await {
                    queue_event!(
                        warn,
                        "refresher::pipeline::changes",
                        "notify_failed",
                        queue = queue,
                        app_id = app,
                        error = err
                    );
                }
            }
        }
        Outcome::Done
    }
}

#[async_trait]
impl Pipeline for ChangesPipeline {
    type Payload = ChangeRequest;

    fn name(&self) -> &'static str {
        "changes"
    }

    async fn process(&self, batch: Vec<Message<ChangeRequest>>) -> Result<()> {
        for message in &batch {
            match self.policy.admit(message).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    action_failed(message, &err);
                    continue;
                }
            }
            let outcome = self.handle(message).await;
            if let Err(err) = self.policy.settle(message, outcome).await {
                action_failed(message, &err);
            }
        }
        Ok(())
    }
}
