use crate::errors::{SourceError, SourceErrorKind};
use async_trait::async_trait;
use log::warn;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Bounded exponential backoff, expressed as data.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub rate_limited_min_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            rate_limited_min_delay: Duration::from_millis(5000),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for(
        &self,
        attempt: u32,
        kind: SourceErrorKind,
        retry_after: Option<Duration>,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = scaled_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        let mut delay = Duration::from_millis(capped_ms.round() as u64);
        if kind == SourceErrorKind::RateLimited {
            delay = delay.max(self.rate_limited_min_delay);
            if let Some(hint) = retry_after {
                delay = delay.max(hint);
            }
        }
        delay
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as u64;
        let jitter_range = (delay_ms as f64 * self.jitter_ratio) as u64;
        let jitter = fastrand::u64(0..=jitter_range * 2);
        Duration::from_millis(delay_ms.saturating_sub(jitter_range).saturating_add(jitter))
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock for retry tests: records requested delays and returns at once.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut guard) = self.delays.lock() {
            guard.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

pub struct RetryOutcome<T> {
    pub result: Result<T, SourceError>,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails permanently or the policy's
/// attempt ceiling is reached. Sleeping yields, so other workers keep going.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    context: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                let kind = err.kind();
                if kind == SourceErrorKind::Permanent || attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                let retry_after = match &err {
                    SourceError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                let delay = policy.jittered(policy.delay_for(attempt, kind, retry_after));
                warn!(
                    "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                    attempt,
                    max_attempts,
                    context,
                    err,
                    delay.as_millis()
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retries a snapshot store call on the same schedule as transient source
/// failures. Store errors are opaque, so every failure counts as transient
/// until the attempt ceiling.
pub async fn retry_store<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    context: &str,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                return Err(err.context(format!("{} failed after {} attempts", context, attempt)))
            }
            Err(err) => {
                let delay =
                    policy.jittered(policy.delay_for(attempt, SourceErrorKind::Transient, None));
                warn!(
                    "Attempt {}/{} for {} failed: {:#}. Retrying in {}ms.",
                    attempt,
                    max_attempts,
                    context,
                    err,
                    delay.as_millis()
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
