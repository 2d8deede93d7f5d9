//! # Retry Policy
//!
//! Exponential backoff with jitter for remote mutations.
//!
//! Only [`Error::Transient`] failures are retried. A server-provided
//! `Retry-After` replaces the computed delay for that attempt, capped at
//! `max`. Sleeps are interrupted by cancellation; the call in flight is always
//! allowed to finish.

use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::observability::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub start: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BootstrapConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            start: config.backoff_start_duration(),
            max: config.backoff_max_duration(),
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.start.saturating_mul(factor).min(self.max)
    }

    fn delay(&self, attempt: u32, err: &Error) -> Duration {
        if let Some(retry_after) = err.retry_after() {
            if retry_after > self.max {
                warn!(
                    retry_after_secs = retry_after.as_secs(),
                    max_ms = self.max.as_millis(),
                    "Server asked for a longer wait than the backoff cap, clamping"
                );
                return self.max;
            }
            return retry_after;
        }
        // 0.5x to 1.5x of the base delay, never above the cap
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter).min(self.max)
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<F, Fut, T>(
        &self,
        step: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                error!(%step, attempt, error = %err, "Giving up after transient failures");
                return Err(err);
            }

            let delay = self.delay(attempt, &err);
            warn!(
                %step,
                attempt,
                error = %err,
                delay_ms = delay.as_millis(),
                "Transient failure, retrying"
            );
            metrics::increment_retries(step);

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("cancelled while retrying {step}")));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
