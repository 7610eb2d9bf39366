//! Exponential backoff with jitter, per-attempt timeouts and an attempt
//! ceiling.
//!
//! All waiting goes through `tokio::time`, which runs on the monotonic
//! clock: device time adjustments neither shorten nor stretch a backoff.
//! Dropping a retrying future cancels its pending sleep.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Computes retry delays and drives retry loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    attempt_timeout: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_ratio: config.jitter_ratio.max(0.0),
            attempt_timeout: config.attempt_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Returns a copy with a different attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Delay before retrying after the given zero-based attempt failed:
    /// `base * 2^attempt + uniform(0, jitter_ratio * base)`, capped at the
    /// configured maximum.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max_delay);

        let jitter_max = self.base.mul_f64(self.jitter_ratio);
        let jitter = if jitter_max.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=jitter_max)
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Runs `operation` with the configured attempt ceiling.
    pub async fn run<T, F, Fut>(&self, operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.with_retry(self.max_attempts, operation).await
    }

    /// Invokes `operation` up to `max_attempts` times.
    ///
    /// Retryable failures (network errors and attempt timeouts) wait
    /// [`compute_delay`](Self::compute_delay) before the next attempt;
    /// other errors are returned immediately. After the last attempt fails
    /// the result is [`SyncError::ExhaustedRetries`] carrying the final
    /// error.
    pub async fn with_retry<T, F, Fut>(&self, max_attempts: u32, operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.with_retry_observed(max_attempts, operation, |_, _, _| {})
            .await
    }

    /// Like [`with_retry`](Self::with_retry), calling `on_retry(attempt,
    /// error, delay)` before each backoff sleep.
    pub async fn with_retry_observed<T, F, Fut, O>(
        &self,
        max_attempts: u32,
        mut operation: F,
        mut on_retry: O,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        O: FnMut(u32, &SyncError, Duration),
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= max_attempts {
                return Err(SyncError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.compute_delay(attempt - 1);
            debug!(
                "attempt {}/{} failed: {}, retrying in {:?}",
                attempt, max_attempts, err, delay
            );
            on_retry(attempt, &err, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
