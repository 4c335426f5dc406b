//! Core processor trait and the generic QueueWorker implementation.
//!
//! This module provides:
//! - `MessageProcessor` trait for message handlers
//! - `QueueWorker` struct for running the consume loop

use crate::amqp::AmqpSession;
use crate::config::WorkerConfig;
use crate::error::{ProcessingError, QueueError};
use crate::message::InboundMessage;
use crate::metrics::QueueMetrics;
use crate::policy::{Disposition, RetryPolicy};
use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Trait for message processors.
///
/// Domain handlers implement this trait to process raw queue payloads. The
/// worker turns the result into a [`Disposition`] via its [`RetryPolicy`].
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::{MessageProcessor, ProcessingError};
///
/// struct AuditProcessor;
///
/// #[async_trait]
/// impl MessageProcessor for AuditProcessor {
///     async fn process(&self, payload: &[u8]) -> Result<(), ProcessingError> {
///         let event: AuditEvent = serde_json::from_slice(payload)
///             .map_err(|e| ProcessingError::permanent(e.to_string()))?;
///         store(event).await.map_err(|e| ProcessingError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "AuditProcessor"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process a single message body.
    ///
    /// Transient errors are requeued until the retry budget is spent,
    /// permanent errors are rejected.
    async fn process(&self, payload: &[u8]) -> Result<(), ProcessingError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;

    /// Release resources after the last in-flight message finished.
    async fn shutdown(&self) {}
}

/// Why a consume loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumeEnd {
    Shutdown,
    StreamClosed,
}

/// Generic queue worker that processes messages using a processor.
///
/// - Bounded concurrency (semaphore, prefetch equal to concurrency)
/// - Requeue with exponential backoff and a poison-message guard
/// - Reconnect when the broker connection drops
/// - Graceful shutdown with a grace period for in-flight messages
pub struct QueueWorker<P>
where
    P: MessageProcessor,
{
    processor: Arc<P>,
    config: WorkerConfig,
    amqp: AmqpConfig,
    metrics: QueueMetrics,
    /// Semaphore to limit concurrent message processing
    concurrency_semaphore: Arc<Semaphore>,
}

impl<P> QueueWorker<P>
where
    P: MessageProcessor + 'static,
{
    /// Create a new queue worker.
    pub fn new(processor: P, config: WorkerConfig, amqp: AmqpConfig) -> Self {
        Self::with_arc_processor(Arc::new(processor), config, amqp)
    }

    /// Create a new queue worker with an Arc processor.
    pub fn with_arc_processor(processor: Arc<P>, config: WorkerConfig, amqp: AmqpConfig) -> Self {
        let metrics = QueueMetrics::new(amqp.queue.clone(), processor.name());
        let concurrency_semaphore = Arc::new(Semaphore::new(config.concurrency));

        Self {
            processor,
            config,
            amqp,
            metrics,
            concurrency_semaphore,
        }
    }

    /// Run the worker until shutdown is signalled.
    ///
    /// Fails only when the broker stays unreachable for the whole connect
    /// retry budget.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            queue = %self.amqp.queue,
            consumer_tag = %self.config.consumer_tag,
            processor = %self.processor.name(),
            concurrency = %self.config.concurrency,
            max_retries = %self.config.retry.max_retries,
            "Starting queue worker"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let session = match AmqpSession::connect_with_retry(
                &self.amqp,
                self.config.prefetch(),
                &mut shutdown,
            )
            .await
            {
                Ok(Some(session)) => session,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Giving up on broker connection");
                    self.drain(&mut tasks).await;
                    self.processor.shutdown().await;
                    return Err(e);
                }
            };
            self.metrics.connected();

            let messages = match session.consume(&self.config.consumer_tag).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Failed to start consumer, reconnecting");
                    session.close().await;
                    if sleep_or_shutdown(self.amqp.connect_retry_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.consume(messages, &mut tasks, &mut shutdown).await {
                ConsumeEnd::Shutdown => {
                    info!("Received shutdown signal, cancelling consumer");
                    session.cancel(&self.config.consumer_tag).await;
                    self.drain(&mut tasks).await;
                    self.processor.shutdown().await;
                    session.close().await;
                    info!("Queue worker stopped");
                    return Ok(());
                }
                ConsumeEnd::StreamClosed => {
                    // unsettled deliveries on the dead channel are redelivered by the broker
                    warn!(
                        in_flight = %tasks.len(),
                        "Broker connection lost, reconnecting"
                    );
                    session.close().await;
                }
            }
        }

        self.drain(&mut tasks).await;
        self.processor.shutdown().await;
        info!("Queue worker stopped");
        Ok(())
    }

    /// Pull messages and spawn a task per message until shutdown or the stream ends.
    async fn consume<S, M>(
        &self,
        mut messages: S,
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConsumeEnd
    where
        S: Stream<Item = Result<M, QueueError>> + Unpin,
        M: InboundMessage,
    {
        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                _ = wait_for_shutdown(shutdown) => return ConsumeEnd::Shutdown,
                permit = Arc::clone(&self.concurrency_semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return ConsumeEnd::Shutdown,
                },
            };

            let next = tokio::select! {
                _ = wait_for_shutdown(shutdown) => return ConsumeEnd::Shutdown,
                next = messages.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(error = %e, "Consumer stream failed");
                    return ConsumeEnd::StreamClosed;
                }
                None => return ConsumeEnd::StreamClosed,
            };

            self.metrics.message_received();

            let processor = Arc::clone(&self.processor);
            let policy = self.config.retry;
            let metrics = self.metrics.clone();
            let semaphore = Arc::clone(&self.concurrency_semaphore);
            let concurrency = self.config.concurrency;
            let task_shutdown = shutdown.clone();

            metrics.in_flight(concurrency - semaphore.available_permits());

            tasks.spawn(async move {
                process_message(processor.as_ref(), policy, &metrics, message, task_shutdown)
                    .await;
                drop(permit);
                metrics.in_flight(concurrency - semaphore.available_permits());
            });
        }
    }

    /// Wait for in-flight messages, abandoning them once the grace period elapses.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(
            in_flight = %tasks.len(),
            grace_secs = %self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight messages"
        );

        let finished = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join_error(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                remaining = %tasks.len(),
                "Grace period elapsed, abandoning in-flight messages to broker redelivery"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Process one message, decide its disposition and settle it.
async fn process_message<P, M>(
    processor: &P,
    policy: RetryPolicy,
    metrics: &QueueMetrics,
    message: M,
    mut shutdown: watch::Receiver<bool>,
) -> Disposition
where
    P: MessageProcessor + ?Sized,
    M: InboundMessage,
{
    let start = Instant::now();
    let tag = message.tag();
    let attempt = message.attempt();

    let result = AssertUnwindSafe(processor.process(message.payload()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ProcessingError::Panicked(panic_message(panic.as_ref()))));

    let disposition = policy.decide(&result, attempt);

    match (&disposition, &result) {
        (Disposition::Ack, _) => {
            debug!(delivery_tag = %tag, attempt = %attempt, "Message processed");
        }
        (Disposition::Requeue { attempt: next, delay }, Err(e)) => {
            warn!(
                delivery_tag = %tag,
                attempt = %next,
                max_retries = %policy.max_retries,
                delay_ms = %delay.as_millis(),
                error = %e,
                "Transient failure, requeueing message"
            );
        }
        (_, Err(e)) => {
            warn!(
                delivery_tag = %tag,
                attempt = %attempt,
                error = %e,
                error_category = %e.category().as_str(),
                "Rejecting message"
            );
        }
        _ => {}
    }

    if let Disposition::Requeue { delay, .. } = &disposition {
        if sleep_or_shutdown(*delay, &mut shutdown).await {
            debug!(delivery_tag = %tag, "Shutdown during backoff, requeueing now");
        }
    }

    if let Err(e) = message.settle(&disposition).await {
        error!(
            delivery_tag = %tag,
            disposition = %disposition.label(),
            error = %e,
            "Failed to settle message"
        );
        metrics.settle_failed();
    }

    metrics.message_settled(&disposition, start.elapsed());
    disposition
}

/// Resolve once the shutdown flag is set or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `true` on shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(shutdown) => true,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(error = %e, "Message task failed");
        }
    }
}
