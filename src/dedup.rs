//! "At most one in-flight request per entity", enforced at publish time with TTL'd markers.
//!
//! Markers are never released; they expire by TTL, which gives each entity a refresh
//! cool-down.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SHARDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub kind: String,
    pub id: String,
}

impl DedupKey {
    pub fn new(kind: impl Into<String>, id: impl fmt::Display) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Cache key under `prefix`, e.g. `queue:app:440`.
    pub fn cache_key(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.to_string()
        } else {
            format!("{prefix}:{self}")
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
    #[error("dedup ttl must be at least one millisecond")]
    InvalidTtl,
}

/// Atomic set-if-absent with expiry, shared by every producer that should see the marker.
#[async_trait]
pub trait DedupStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `true` if the marker was created, `false` if a live one already exists.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError>;
}

/// Process-local store. Only deduplicates within one process.
pub struct MemoryDedupStore {
    shards: Vec<Mutex<HashMap<String, Instant>>>,
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Instant>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Live markers across all shards.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .expect("dedup shard lock poisoned")
                    .values()
                    .filter(|expires| **expires > now)
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired markers and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.lock().expect("dedup shard lock poisoned");
            let before = entries.len();
            entries.retain(|_, expires| *expires > now);
            removed += before - entries.len();
        }
        removed
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            tracing::debug!(
                                target: "refresher::dedup",
                                event = "swept",
                                removed = removed
                            );
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
        let now = Instant::now();
        let mut entries = self.shard(key).lock().expect("dedup shard lock poisoned");
        match entries.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisDedupStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::{DedupError, DedupStore};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::Client;
    use std::time::Duration;

    /// Markers shared across processes through `SET key 1 NX PX ttl`.
    #[derive(Clone)]
    pub struct RedisDedupStore {
        connection: ConnectionManager,
    }

    impl RedisDedupStore {
        pub async fn connect(url: &str) -> Result<Self, DedupError> {
            let client = Client::open(url).map_err(|err| {
                DedupError::Unavailable(format!("invalid redis url: {err}"))
            })?;
            let connection = ConnectionManager::new(client)
                .await
                .map_err(|err| DedupError::Unavailable(format!("failed to connect: {err}")))?;
            Ok(Self { connection })
        }
    }

    #[async_trait]
    impl DedupStore for RedisDedupStore {
        fn name(&self) -> &'static str {
            "redis"
        }

        async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
            let mut connection = self.connection.clone();
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(1)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async(&mut connection)
                .await
                .map_err(|err| DedupError::Unavailable(err.to_string()))?;
            Ok(reply.is_some())
        }
    }
}

/// Dedup policy applied by the producer: key prefix plus marker lifetime.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
    prefix: String,
    ttl: Duration,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn DedupStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    /// Reserves `key` for the configured TTL.
    pub async fn reserve(&self, key: &DedupKey) -> Result<bool, DedupError> {
        self.try_reserve(key, self.ttl).await
    }

    /// Reserves `key` for `ttl`. `false` means a request for the entity is already queued.
    pub async fn try_reserve(&self, key: &DedupKey, ttl: Duration) -> Result<bool, DedupError> {
        if ttl < Duration::from_millis(1) {
            return Err(DedupError::InvalidTtl);
        }
        self.store
            .set_if_absent(&key.cache_key(&self.prefix), ttl)
            .await
    }
}
