//! Per-delivery retry with exponential backoff
//!
//! A handler gets `max_retries + 1` attempts. The wait before retry `n`
//! (0-based) is `initial_delay * 2^n`, capped at `max_delay`. Every wait
//! races the cancellation token so shutdown never sits out a long backoff.

use crate::config::{ConsumerConfig, DEFAULT_RETRY_START};
use crate::error::HandlerError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration for handler invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,

    /// Wait before the first retry
    pub initial_delay: Duration,

    /// Cap for a single wait
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Total attempts, first one included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&ConsumerConfig> for RetryPolicy {
    fn from(config: &ConsumerConfig) -> Self {
        let initial_delay = if config.retry_start.is_zero() {
            DEFAULT_RETRY_START
        } else {
            config.retry_start
        };
        Self::new(config.retry_max, initial_delay, config.retry_max_delay)
    }
}

/// How a retried operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// An attempt succeeded
    Succeeded { attempts: u32 },
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last_error: HandlerError },
    /// An attempt failed with a permanent error; no further attempts
    Permanent { attempts: u32, error: HandlerError },
    /// Cancellation arrived during a failed attempt or a backoff wait
    Cancelled { attempts: u32, last_error: HandlerError },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Permanent { attempts, .. }
            | RetryOutcome::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancel` fires.
///
/// A retryable failure observed after `cancel` fired ends as `Cancelled`,
/// never `Exhausted`.
///
/// The operation receives the 1-based attempt number.
pub async fn run_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match operation(attempt).await {
            Ok(()) => return RetryOutcome::Succeeded { attempts: attempt },
            Err(error) if !error.is_retryable() => {
                return RetryOutcome::Permanent {
                    attempts: attempt,
                    error,
                };
            }
            Err(error) => error,
        };

        // A failure caused by shutdown is not the delivery's fault, even on
        // the last attempt
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled {
                attempts: attempt,
                last_error: error,
            };
        }

        if attempt >= policy.max_attempts() {
            return RetryOutcome::Exhausted {
                attempts: attempt,
                last_error: error,
            };
        }

        let delay = policy.delay_for(attempt - 1);
        debug!(
            attempt,
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome::Cancelled {
                    attempts: attempt,
                    last_error: error,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
