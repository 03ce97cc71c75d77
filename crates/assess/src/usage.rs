use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::InvocationError;

/// Model usage counters shared by every worker.
#[derive(Default)]
pub struct Usage {
    // Counters
    calls: AtomicUsize,
    successful_calls: AtomicUsize,
    failed_calls: AtomicUsize,
    retries: AtomicUsize,
    rate_limited: AtomicUsize,
    timeouts: AtomicUsize,

    // Tokens
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    /// Calls whose token counts were estimated rather than reported.
    estimated_calls: AtomicUsize,

    // Timing (in microseconds)
    total_call_time_us: AtomicU64,
}

impl Usage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// One HTTP attempt finished, successfully or not.
    pub fn record_call(&self, duration: Duration, error: Option<&InvocationError>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_call_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        match error {
            None => {
                self.successful_calls.fetch_add(1, Ordering::Relaxed);
            }
            Some(e) => {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                match e {
                    InvocationError::RateLimited { .. } => {
                        self.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    InvocationError::Timeout(_) => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, prompt: u64, completion: u64, estimated: bool) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        if estimated {
            self.estimated_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let calls = self.calls.load(Ordering::Relaxed);
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        let total_us = self.total_call_time_us.load(Ordering::Relaxed) as f64;

        UsageSnapshot {
            calls,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_calls: self.estimated_calls.load(Ordering::Relaxed),
            avg_call_time_ms: if calls > 0 {
                total_us / calls as f64 / 1000.0 // Convert to ms
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub calls: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub retries: usize,
    pub rate_limited: usize,
    pub timeouts: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_calls: usize,
    pub avg_call_time_ms: f64,
}

impl UsageSnapshot {
    pub fn estimated_cost_usd(&self, usd_per_million_tokens: f64) -> f64 {
        self.total_tokens as f64 / 1_000_000.0 * usd_per_million_tokens
    }
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls_retries_and_tokens() {
        let usage = Usage::new();
        let limited = InvocationError::RateLimited {
            retry_after: None,
            message: String::new(),
        };

        usage.record_call(Duration::from_millis(10), Some(&limited));
        usage.record_retry();
        usage.record_call(Duration::from_millis(30), None);
        usage.record_tokens(1200, 300, false);

        let snap = usage.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.successful_calls, 1);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.total_tokens, 1500);
        assert!((snap.avg_call_time_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let snap = UsageSnapshot {
            total_tokens: 2_000_000,
            ..UsageSnapshot::default()
        };
        assert!((snap.estimated_cost_usd(15.0) - 30.0).abs() < 1e-9);
    }
}
