//! Queue Worker Framework
//!
//! A generic AMQP (RabbitMQ) worker for processing queue messages.
//!
//! ## Features
//!
//! - **Generic worker**: `QueueWorker<P>` drives any `MessageProcessor`
//! - **Explicit dispositions**: every message ends in exactly one ack, reject or requeue
//! - **Bounded retries**: transient failures are republished with an
//!   `x-retry-count` header and exponential backoff, poison messages are rejected
//! - **Reconnect**: connection retries at startup and after broker loss
//! - **Prometheus metrics**: built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use core_config::{amqp::AmqpConfig, FromEnv};
//! use queue_worker::{QueueWorker, WorkerConfig};
//!
//! let worker = QueueWorker::new(processor, WorkerConfig::from_env()?, AmqpConfig::from_env()?);
//! worker.run(shutdown_rx).await?;
//! ```

pub mod amqp;
mod config;
mod error;
mod message;
pub mod metrics;
mod policy;
mod worker;

// Re-export main types
pub use amqp::{AmqpMessage, AmqpSession};
pub use config::{MAX_CONCURRENCY, WorkerConfig};
pub use error::{ErrorCategory, ProcessingError, QueueError};
pub use message::{InboundMessage, RETRY_HEADER};
pub use metrics::{QueueMetrics, init_metrics};
pub use policy::{Disposition, RetryPolicy};
pub use worker::{MessageProcessor, QueueWorker};
