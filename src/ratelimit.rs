//! Per-key token buckets, created on first use and evicted once idle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A token bucket for a single key.
///
/// Tokens refill continuously from the elapsed time since the last refill and never
/// exceed the burst capacity. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    rate_per_second: f64,
    burst: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Negative values are clamped to 0.0.
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        let burst = burst.max(0.0);
        Self {
            tokens: burst,
            rate_per_second: rate_per_second.max(0.0),
            burst,
            last_refill: Instant::now(),
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.burst);
            self.last_refill = now;
        }
    }

    /// Consumes `n` tokens if available; otherwise leaves the bucket untouched.
    pub fn try_consume(&mut self, n: f64) -> bool {
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Time until `n` tokens are available, assuming no other consumer.
    pub fn time_until(&self, n: f64) -> Duration {
        let deficit = n - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else if self.rate_per_second <= 0.0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs_f64(deficit / self.rate_per_second)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitSettings {
    pub rate_per_second: f64,
    pub burst: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 1.0,
            burst: 5.0,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    last_used: Instant,
}

#[derive(Debug)]
struct LimiterEntry {
    state: Mutex<LimiterState>,
}

impl LimiterEntry {
    fn new(settings: RateLimitSettings) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(settings.rate_per_second, settings.burst),
                last_used: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().expect("rate limiter lock poisoned")
    }

    fn touch(&self) {
        self.lock().last_used = Instant::now();
    }

    fn last_used(&self) -> Instant {
        self.lock().last_used
    }
}

/// Handle to one key's bucket.
#[derive(Clone, Debug)]
pub struct Limiter {
    key: Arc<str>,
    entry: Arc<LimiterEntry>,
}

impl Limiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Takes a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.entry.lock();
        state.last_used = now;
        state.bucket.refill(now);
        state.bucket.try_consume(1.0)
    }

    /// Waits until a token is available and takes it.
    pub async fn wait(&self) {
        loop {
            let delay = {
                let now = Instant::now();
                let mut state = self.entry.lock();
                state.last_used = now;
                state.bucket.refill(now);
                if state.bucket.try_consume(1.0) {
                    return;
                }
                state.bucket.time_until(1.0)
            };
            tracing::trace!(
                target: "refresher::ratelimit",
                event = "throttled",
                key = %self.key,
                wait_ms = delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn tokens(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.entry.lock();
        state.bucket.refill(now);
        state.bucket.tokens()
    }
}

/// Lazily creates a bucket per key and evicts buckets idle longer than the retention window.
pub struct RateLimiterRegistry {
    default: RateLimitSettings,
    overrides: HashMap<String, RateLimitSettings>,
    retention: Duration,
    entries: RwLock<HashMap<String, Arc<LimiterEntry>>>,
}

impl RateLimiterRegistry {
    pub fn new(default: RateLimitSettings, retention: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            retention,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Uses `settings` instead of the default for `key`.
    pub fn with_override(mut self, key: impl Into<String>, settings: RateLimitSettings) -> Self {
        self.overrides.insert(key.into(), settings);
        self
    }

    pub fn settings_for(&self, key: &str) -> RateLimitSettings {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    pub fn limiter(&self, key: &str) -> Limiter {
        let existing = self
            .entries
            .read()
            .expect("rate limiter registry lock poisoned")
            .get(key)
            .cloned();

        let entry = match existing {
            Some(entry) => {
                entry.touch();
                entry
            }
            None => {
                let mut entries = self
                    .entries
                    .write()
                    .expect("rate limiter registry lock poisoned");
                let entry = entries
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(LimiterEntry::new(self.settings_for(key))));
                entry.touch();
                Arc::clone(entry)
            }
        };

        Limiter {
            key: Arc::from(key),
            entry,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("rate limiter registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes limiters idle for longer than the retention window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .expect("rate limiter registry lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_used()) <= self.retention);
        before - entries.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep();
                        if evicted > 0 {
                            tracing::debug!(
                                target: "refresher::ratelimit",
                                event = "evicted",
                                evicted = evicted,
                                remaining = registry.len()
                            );
                        }
                    }
                }
            }
        })
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitSettings::default(), Duration::from_secs(3600))
    }
}
