//! Retry helpers: exponential backoff with jitter, optimistic
//! read-modify-write, and the per-Capp requeue backoff used by the error
//! policy.

use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Scales `delay` by a random factor in `0.5..1.5`.
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Runs `operation` until it succeeds or the attempt budget runs out,
/// retrying only errors `retryable` accepts.
async fn retry_when<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) if config.exhausted(attempt) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    "giving up after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = jittered(config.delay_for(attempt));
                debug!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Retries transient failures with exponential backoff.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_when(config, operation_name, Error::is_transient, operation).await
}

/// Optimistic read-modify-write: `operation` must re-fetch the object, apply
/// its change and submit it. Only conflicts are retried.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_when(config, operation_name, Error::is_conflict, operation).await
}

/// Per-object failure counts driving bounded exponential requeues.
///
/// A key that has not failed for twice the maximum delay is dropped, so
/// objects deleted while failing do not pin their entry forever.
#[derive(Debug)]
pub struct RequeueBackoff {
    config: RetryConfig,
    failures: Mutex<HashMap<String, Failures>>,
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    last: Instant,
}

impl RequeueBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            config: RetryConfig {
                max_attempts: 0,
                initial_delay: base,
                max_delay: max,
                backoff_multiplier: 2.0,
            },
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn horizon(&self) -> Duration {
        self.config.max_delay.saturating_mul(2)
    }

    /// Records a failure for `key` and returns how long to wait.
    pub fn next_delay(&self, key: &str) -> Duration {
        let now = Instant::now();
        let horizon = self.horizon();
        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures.retain(|_, f| now.duration_since(f.last) <= horizon);
            let entry = failures.entry(key.to_string()).or_insert(Failures {
                count: 0,
                last: now,
            });
            entry.count = entry.count.saturating_add(1);
            entry.last = now;
            entry.count
        };
        jittered(self.config.delay_for(attempt)).min(self.config.max_delay)
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map_or(0, |f| f.count)
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
