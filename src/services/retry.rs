//! Bounded exponential backoff for tracker calls.
//!
//! Every call owns its own attempt counter; nothing here is shared between
//! concurrent calls.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff settings for tracker requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay to between 50% and 100% of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
pub enum AttemptError {
    /// Worth retrying (timeout, connection failure, 5xx, rate limit).
    Transient {
        message: String,
        /// Server-provided wait, e.g. from `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help; surfaced as-is.
    Permanent(AppError),
}

impl AttemptError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl RetryPolicy {
    /// Nominal delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            nominal.mul_f64(factor)
        } else {
            nominal
        }
    }

    /// Run `attempt_fn` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Exhaustion yields [`AppError::TrackerUnavailable`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(err)) => {
                    log::error!("{} failed (non-retryable): {}", operation, err);
                    return Err(err);
                }
                Err(AttemptError::Transient {
                    message,
                    retry_after,
                }) => {
                    if attempt >= max_attempts {
                        log::error!(
                            "{} failed after {} attempts: {}",
                            operation,
                            attempt,
                            message
                        );
                        return Err(AppError::tracker_unavailable_after(
                            format!("{} failed after {} attempts: {}", operation, attempt, message),
                            attempt,
                        ));
                    }

                    let delay = match retry_after {
                        Some(wait) => wait.min(self.max_delay),
                        None => self.delay_for(attempt),
                    };
                    log::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        operation,
                        attempt,
                        max_attempts,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
