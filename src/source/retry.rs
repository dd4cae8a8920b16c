//! Retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::{Error, Result};

/// Exponential backoff policy for origin requests
///
/// Only errors with [`Error::is_retryable`] are retried. The delay before
/// retry `n` (0-based) is `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// Each attempt is bounded by `per_attempt`; an expired attempt counts as
    /// a retryable [`Error::Timeout`]. `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, per_attempt: Duration, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            let err = match timeout(per_attempt, op(attempt)).await {
                Ok(Ok(value)) => return Ok(value),
                // Client-side timeouts do not carry the deadline
                Ok(Err(Error::Timeout(d))) if d.is_zero() => Error::Timeout(per_attempt),
                Ok(Err(err)) => err,
                Err(_) => Error::Timeout(per_attempt),
            };

            if !err.is_retryable() {
                return Err(err);
            }

            attempt += 1;
            if attempt >= attempts {
                return Err(Error::Exhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for_attempt(attempt - 1);
            warn!(
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying origin request"
            );
            sleep(delay).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
