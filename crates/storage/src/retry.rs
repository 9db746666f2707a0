//! Per-call timeout and exponential backoff for transient failures.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::StorageError;

/// An error type the retry loop knows how to classify.
pub trait RetryableError: fmt::Display {
    /// Whether another attempt may succeed (rate limit, 5xx, timeout).
    fn is_transient(&self) -> bool;

    /// The error to report when a single attempt exceeds its deadline.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

impl RetryableError for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        StorageError::Timeout {
            operation: operation.to_string(),
            seconds: after.as_secs(),
        }
    }
}

/// Backoff schedule: `base * factor^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Deadline for each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(32),
            max_attempts: 5,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    pub fn immediate() -> Self {
        RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Each attempt is bounded by `call_timeout`.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, self.call_timeout)),
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(operation, attempts = attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}
