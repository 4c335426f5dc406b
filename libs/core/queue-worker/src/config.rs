//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the queue worker.

use crate::policy::RetryPolicy;
use core_config::{ConfigError, FromEnv, env_parse_or};
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for concurrently processed messages
pub const MAX_CONCURRENCY: usize = 64;

/// Configuration for the queue worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer tag announced to the broker (auto-generated)
    pub consumer_tag: String,

    /// Messages processed concurrently, also used as channel prefetch
    pub concurrency: usize,

    /// Requeue budget and backoff
    pub retry: RetryPolicy,

    /// Time in-flight messages get to finish after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_tag: format!("mail-worker-{}", Uuid::new_v4()),
            concurrency: 4,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Set the consumer tag
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the concurrency, clamped to 1..=64
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Channel prefetch count
    pub fn prefetch(&self) -> u16 {
        // concurrency is clamped to MAX_CONCURRENCY
        self.concurrency as u16
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let retry = RetryPolicy::new(
            env_parse_or("MAX_RETRIES", 5)?,
            Duration::from_millis(env_parse_or("RETRY_BASE_DELAY_MS", 1000)?),
            Duration::from_millis(env_parse_or("RETRY_MAX_DELAY_MS", 30_000)?),
        );

        Ok(Self::default()
            .with_concurrency(env_parse_or("WORKER_CONCURRENCY", 4)?)
            .with_retry_policy(retry)
            .with_shutdown_grace(Duration::from_secs(env_parse_or(
                "SHUTDOWN_GRACE_SECS",
                30,
            )?)))
    }
}
