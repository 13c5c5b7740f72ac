//! Exponential backoff with jitter for fallible async operations.

use crate::network::error::EngineError;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

/// Errors the retry loop can tell apart from ordinary failures.
///
/// Cancellation is never retried and is returned as-is.
pub trait Retryable {
    fn is_cancellation(&self) -> bool;

    /// The error to return when the caller cancels mid-retry
    fn cancelled() -> Self;
}

impl Retryable for EngineError {
    fn is_cancellation(&self) -> bool {
        self.is_cancelled()
    }

    fn cancelled() -> Self {
        EngineError::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

/// Bookkeeping for one `execute` call
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub delay: Duration,
    pub last_error: Option<String>,
}

impl RetryPolicy {
    /// Policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Capped exponential delay before retry number `attempt` (0-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            self.max_delay
        }
    }

    /// `base_delay` with jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        delay.mul_f64(factor)
    }

    /// Retry every failure except cancellation
    pub async fn execute<T, E, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        self.execute_with(operation, |_| true, cancel).await
    }

    /// Retry failures accepted by `should_retry`; the last error comes back unchanged
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Retryable + fmt::Display,
    {
        let mut context = RetryContext::default();

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(E::cancelled()),
                outcome = operation() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if context.attempt > 0 {
                        debug!(attempts = context.attempt + 1, "Operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_cancellation() {
                return Err(err);
            }
            if !should_retry(&err) {
                debug!(error = %err, "Failure is not retryable");
                return Err(err);
            }
            if context.attempt >= self.max_retries {
                warn!(
                    attempts = context.attempt + 1,
                    error = %err,
                    "Giving up after exhausting retries"
                );
                return Err(err);
            }
            if cancel.is_cancelled() {
                return Err(E::cancelled());
            }

            context.delay = self.delay_for_attempt(context.attempt);
            context.last_error = Some(err.to_string());
            debug!(
                attempt = context.attempt + 1,
                max_retries = self.max_retries,
                delay_ms = context.delay.as_millis() as u64,
                error = context.last_error.as_deref().unwrap_or_default(),
                "Retrying after failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(E::cancelled()),
                _ = tokio::time::sleep(context.delay) => {}
            }
            context.attempt += 1;
        }
    }
}
