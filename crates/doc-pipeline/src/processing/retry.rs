//! Retry decisions for failed executions
//!
//! Pure: the same failure, attempt number and policy always give the same
//! decision. Nothing here touches the store or the clock.

use std::time::Duration;

use crate::types::{ErrorKind, JobError};

/// What to do with a job whose execution just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue, claimable again after `delay`
    Retry { delay: Duration },
    /// Record the error and stop
    Fail,
}

/// Exponential backoff policy of one job type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Decide for `error`, where `attempt` is the 1-based number of the
    /// execution that just failed.
    pub fn decide(&self, error: &JobError, attempt: u32) -> RetryDecision {
        decide(error.kind, error.permanent, attempt, self)
    }

    /// Delay before the retry that follows failed attempt `attempt`:
    /// `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Map a classified failure to a retry decision.
///
/// Validation failures and anything marked permanent fail at once. Every
/// other kind is retried while `attempt < max_attempts`.
pub fn decide(kind: ErrorKind, permanent: bool, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
    if permanent || kind == ErrorKind::Validation {
        return RetryDecision::Fail;
    }

    match kind {
        ErrorKind::ToolExecution | ErrorKind::Timeout | ErrorKind::Transient
            if attempt < policy.max_attempts =>
        {
            RetryDecision::Retry {
                delay: policy.backoff(attempt),
            }
        }
        _ => RetryDecision::Fail,
    }
}
