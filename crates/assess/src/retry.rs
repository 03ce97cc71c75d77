use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::InvocationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per model call, first attempt included.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Ceiling on a server-provided rate-limit wait.
    pub max_rate_limit_wait_ms: u64,
    /// Re-prompts after a reply that fails validation.
    pub corrective_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            max_rate_limit_wait_ms: 120_000,
            corrective_retries: 1,
        }
    }
}

/// Suspends a retry loop. Injected so schedules can be tested without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Transition out of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then make the next attempt.
    Retry { delay: Duration },
    /// Permanent error; no further attempts.
    Fail,
    /// Transient error but the attempt budget is spent.
    Exhausted,
}

pub struct RetryPolicy {
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_rate_limit_wait: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: &RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_rate_limit_wait: Duration::from_millis(config.max_rate_limit_wait_ms),
            sleeper,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Exponential backoff after failed attempt `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }

    /// Transition after attempt `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: usize, error: &InvocationError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Fail;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = match error.retry_after() {
            Some(hint) => hint.min(self.max_rate_limit_wait),
            None => self.backoff(attempt),
        };
        RetryDecision::Retry { delay }
    }

    /// Run `f` until it succeeds or the policy gives up, returning the value and
    /// the attempts used. `on_retry` sees each failure that will be retried.
    pub async fn run<F, Fut, T, R>(&self, operation_name: &str, mut f: F, mut on_retry: R) -> Result<(T, usize), InvocationError>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, InvocationError>>,
        R: FnMut(&InvocationError),
    {
        let mut attempt = 1;

        loop {
            let error = match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok((result, attempt));
                }
                Err(e) => e,
            };

            match self.decide(attempt, &error) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );
                    on_retry(&error);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::Fail => {
                    warn!(operation = operation_name, attempt, error = %error, "Operation failed with permanent error");
                    return Err(error);
                }
                RetryDecision::Exhausted => {
                    warn!(operation = operation_name, attempts = attempt, error = %error, "Operation failed after max attempts");
                    return Err(InvocationError::Exhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
            }
        }
    }
}
