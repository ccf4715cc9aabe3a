//! Retry decisions for failed attempts.
//!
//! Only faults classified as retryable are retried; merge conflicts, failed
//! builds and missing refs are outcomes and never reach the decider.

use std::time::Duration;

use crate::domain::ErrorKind;

/// Backoff between attempts of the same task.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Growth factor per further attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 2s, 4s, 8s, ...
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after `attempts` failed attempts (1-based):
    /// `base_delay * multiplier^(attempts - 1)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry { delay: Duration, reason: String },
    GiveUp { reason: String },
}

/// A failed attempt as seen by a `Decider`.
#[derive(Debug, Clone, Copy)]
pub struct AttemptFailure<'a> {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub cause: &'a str,
}

/// Decides the next step after a failed attempt. Pure: no side effects.
pub trait Decider: Send + Sync {
    fn decide(&self, failure: &AttemptFailure<'_>) -> Decision;
}

/// Retries retryable faults until `max_attempts`, with `RetryPolicy` backoff.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry_policy,
            max_attempts,
        }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, failure: &AttemptFailure<'_>) -> Decision {
        if !failure.kind.is_retryable() {
            return Decision::GiveUp {
                reason: format!("not retryable: {}", failure.cause),
            };
        }
        if failure.attempt >= self.max_attempts {
            return Decision::GiveUp {
                reason: format!(
                    "max attempts reached: {}/{}",
                    failure.attempt, self.max_attempts
                ),
            };
        }
        let delay = self.retry_policy.next_delay(failure.attempt);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                failure.attempt + 1,
                self.max_attempts,
                delay
            ),
        }
    }
}
