use crate::transport::runtime::sleep_with_shutdown;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_DELAY: Duration = Duration::from_millis(50);

/// Exponential backoff parameters shared by reconnects, re-subscribes and external calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetrySettings {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = if max < initial { initial } else { max };
        Self {
            initial,
            max,
            multiplier: multiplier.clamp(1.1, 10.0),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 2.0)
    }
}

pub struct RetryBackoff {
    policy: RetrySettings,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(policy: RetrySettings) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    pub fn on_success(&mut self) {
        self.current = self.policy.initial;
    }

    /// Returns the delay to wait before the next attempt and advances the schedule.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current.max(MIN_DELAY);
        let next = (delay.as_millis() as f64 * self.policy.multiplier)
            .round()
            .max(self.policy.initial.as_millis() as f64);
        let capped = next.min(self.policy.max.as_millis() as f64);
        let next_duration = Duration::from_millis(capped as u64);
        self.current = std::cmp::min(next_duration, self.policy.max);
        delay
    }
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}

/// Attempt-capped retry used around individual external calls, distinct from the
/// queue-level delay-queue retry.
#[derive(Clone, Debug)]
pub struct BoundedRetry {
    pub max_attempts: u32,
    pub backoff: RetrySettings,
    pub jitter: bool,
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetrySettings::new(Duration::from_millis(500), Duration::from_secs(10), 2.0),
            jitter: true,
        }
    }
}

/// Runs `operation` until it succeeds, returns an error `retryable` rejects, or the attempt
/// budget is spent. The last error is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &BoundedRetry,
    shutdown: &CancellationToken,
    mut operation: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = RetryBackoff::new(policy.backoff.clone());
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !retryable(&err) {
                    return Err(err);
                }

                let base = backoff.on_failure();
                let delay = if policy.jitter {
                    jitter_between(base / 2, base)
                } else {
                    base
                };

                tracing::debug!(
                    target: "refresher::retry",
                    event = "external_call_retry",
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );

                if sleep_with_shutdown(delay, shutdown).await {
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let settings = RetrySettings::new(Duration::from_millis(100), Duration::from_millis(350), 2.0);
        let mut backoff = RetryBackoff::new(settings);

        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
        assert_eq!(backoff.on_failure(), Duration::from_millis(200));
        assert_eq!(backoff.on_failure(), Duration::from_millis(350));
        assert_eq!(backoff.on_failure(), Duration::from_millis(350));

        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
    }

    #[test]
    fn settings_clamp_inverted_bounds() {
        let settings = RetrySettings::new(Duration::from_secs(5), Duration::from_secs(1), 0.5);
        assert_eq!(settings.max(), Duration::from_secs(5));
        assert!((settings.multiplier() - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let value = jitter_between(Duration::from_millis(10), Duration::from_millis(20));
            assert!(value >= Duration::from_millis(10));
            assert!(value <= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = BoundedRetry {
            max_attempts: 3,
            backoff: RetrySettings::new(Duration::from_millis(10), Duration::from_millis(40), 2.0),
            jitter: false,
        };

        let result: Result<(), String> = retry_with_backoff(
            &policy,
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_skips_non_retryable_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &'static str> = retry_with_backoff(
            &BoundedRetry::default(),
            &CancellationToken::new(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("not found") }
            },
            |_| false,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_returns_first_success() {
        let result: Result<u32, String> = retry_with_backoff(
            &BoundedRetry::default(),
            &CancellationToken::new(),
            |attempt| async move {
                if attempt < 2 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
    }
}
