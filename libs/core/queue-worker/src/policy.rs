//! Disposition decisions.
//!
//! `RetryPolicy::decide` maps a processing result and the message's attempt
//! counter to exactly one terminal `Disposition`.

use crate::error::ProcessingError;
use std::time::Duration;

/// What the worker does with a message once processing finished
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Processed successfully, acknowledge
    Ack,
    /// Reject without requeue, the broker dead-letters it if configured
    Reject,
    /// Republish with `attempt` after waiting `delay`
    Requeue { attempt: u32, delay: Duration },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        self.into()
    }
}

/// Retry budget and exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Requeues allowed before a message is rejected as poison
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
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

    /// Backoff before the requeue of a message that has been requeued `attempt` times
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the disposition for a processing result.
    ///
    /// `attempt` is how many times the message has already been requeued.
    pub fn decide(&self, result: &Result<(), ProcessingError>, attempt: u32) -> Disposition {
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) if !e.category().is_retryable() => Disposition::Reject,
            Err(_) if attempt >= self.max_retries => Disposition::Reject,
            Err(_) => Disposition::Requeue {
                attempt: attempt + 1,
                delay: self.backoff_delay(attempt),
            },
        }
    }
}
