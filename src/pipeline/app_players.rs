//! Refreshes the current player count of apps.
//!
//! The whole batch is resolved against the app directory in one call; ids the directory
//! does not know are acked and skipped without holding up the rest.

use crate::envelope::Message;
use crate::error::Result;
use crate::pipeline::{
    action_failed, call_external, ExternalError, Outcome, Pipeline, RetryPolicy, StoreError,
};
use crate::queue_event;
use crate::ratelimit::RateLimiterRegistry;
use crate::retry::BoundedRetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPlayersRequest {
    pub app_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct App {
    pub id: u64,
    pub name: String,
}

#[async_trait]
pub trait AppDirectory: Send + Sync {
    /// Best-effort lookup; unknown ids are simply absent from the result.
    async fn resolve(&self, ids: &[u64]) -> std::result::Result<HashMap<u64, App>, StoreError>;
}

#[async_trait]
pub trait PlayerCountSource: Send + Sync {
    async fn player_count(&self, app_id: u64) -> std::result::Result<u64, ExternalError>;
}

#[async_trait]
pub trait PlayerCountStore: Send + Sync {
    async fn record(
        &self,
        app_id: u64,
        players: u64,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError>;
}

pub struct AppPlayersPipeline {
    directory: Arc<dyn AppDirectory>,
    source: Arc<dyn PlayerCountSource>,
    store: Arc<dyn PlayerCountStore>,
    limiters: Arc<RateLimiterRegistry>,
    limiter_key: String,
    call_retry: BoundedRetry,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl AppPlayersPipeline {
    pub fn new(
        directory: Arc<dyn AppDirectory>,
        source: Arc<dyn PlayerCountSource>,
        store: Arc<dyn PlayerCountStore>,
        limiters: Arc<RateLimiterRegistry>,
    ) -> Self {
        Self {
            directory,
            source,
            store,
            limiters,
            limiter_key: "app-players".to_string(),
            call_retry: BoundedRetry::default(),
            policy: RetryPolicy::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_call_retry(mut self, call_retry: BoundedRetry) -> Self {
        self.call_retry = call_retry;
        self
    }

    pub fn with_limiter_key(mut self, key: impl Into<String>) -> Self {
        self.limiter_key = key.into();
        self
    }

    /// Cuts external-call backoff short when the worker shuts down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn refresh(&self, app: &App) -> Outcome {
        let limiter = self.limiters.limiter(&self.limiter_key);
        let source = &self.source;
        let players = match call_external(&limiter, &self.call_retry, &self.shutdown, |_| {
            source.player_count(app.id)
        })
        .await
        {
            Ok(players) => players,
            Err(err) => {
                tracing::warn!(
                    target: "refresher::pipeline::app_players",
                    event = "fetch_failed",
                    app_id = app.id,
                    error = %err
                );
                return Outcome::from(&err);
            }
        };

        match self.store.record(app.id, players, Utc::now()).await {
            Ok(()) => Outcome::Done,
            Err(err) => {
                if !matches!(err, StoreError::Duplicate(_)) {
                    tracing::warn!(
                        target: "refresher::pipeline::app_players",
                        event = "record_failed",
                        app_id = app.id,
                        error = %err
                    );
                }
                Outcome::from(&err)
            }
        }
    }
}

#[async_trait]
impl Pipeline for AppPlayersPipeline {
    type Payload = AppPlayersRequest;

    fn name(&self) -> &'static str {
        "app-players"
    }

    async fn process(&self, batch: Vec<Message<AppPlayersRequest>>) -> Result<()> {
        let mut admitted = Vec::with_capacity(batch.len());
        for message in batch {
            match self.policy.admit(&message).await {
                Ok(true) => admitted.push(message),
                Ok(false) => {}
                Err(err) => action_failed(&message, &err),
            }
        }
        if admitted.is_empty() {
            return Ok(());
        }

        let ids: Vec<u64> = admitted.iter().map(|message| message.payload().app_id).collect();
        let apps = match self.directory.resolve(&ids).await {
            Ok(apps) => apps,
            Err(err) => {
                let outcome = Outcome::from(&err);
                tracing::warn!(
                    target: "refresher::pipeline::app_players",
                    event = "resolve_failed",
                    batch = admitted.len(),
                    error = %err
                );
                for message in &admitted {
                    if let Err(err) = self.policy.settle(message, outcome).await {
                        action_failed(message, &err);
                    }
                }
                return Ok(());
            }
        };

        for message in &admitted {
            let outcome = match apps.get(&message.payload().app_id) {
                Some(app) => self.refresh(app).await,
                None => {
                    queue_event!(
                        debug,
                        "refresher::pipeline::app_players",
                        "unknown_app",
                        queue = message.handle().queue(),
                        delivery_tag = message.handle().delivery_tag(),
                        app_id = message.payload().app_id
                    );
                    Outcome::Permanent
                }
            };
            if let Err(err) = self.policy.settle(message, outcome).await {
                action_failed(message, &err);
            }
        }
        Ok(())
    }
}
