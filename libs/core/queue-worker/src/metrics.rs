//! Prometheus metrics for queue workers
//!
//! Recorded through the `metrics` facade. Without an installed recorder the
//! calls are no-ops.

use crate::policy::Disposition;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

static EXPORTER: OnceCell<SocketAddr> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Subsequent calls are no-ops. Must be called inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    EXPORTER.get_or_try_init(|| {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(address = %addr, "Prometheus exporter listening");
        Ok::<_, BuildError>(addr)
    })?;
    Ok(())
}

/// Queue worker metrics helper
#[derive(Clone, Debug)]
pub struct QueueMetrics {
    /// Queue name for labeling
    queue: String,
    /// Processor name for labeling
    processor: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            processor: processor.into(),
        }
    }

    /// Record a message being received
    pub fn message_received(&self) {
        counter!(
            "queue_worker_messages_received_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    /// Record the final disposition and processing time of a message
    pub fn message_settled(&self, disposition: &Disposition, duration: Duration) {
        counter!(
            "queue_worker_messages_processed_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone(),
            "disposition" => disposition.label()
        )
        .increment(1);

        histogram!(
            "queue_worker_processing_duration_seconds",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .record(duration.as_secs_f64());

        if let Disposition::Requeue { attempt, .. } = disposition {
            counter!(
                "queue_worker_messages_retried_total",
                "queue" => self.queue.clone(),
                "processor" => self.processor.clone(),
                "attempt" => attempt.to_string()
            )
            .increment(1);
        }
    }

    /// Record a failed ack/reject/requeue
    pub fn settle_failed(&self) {
        counter!(
            "queue_worker_settle_errors_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    /// Update the in-flight gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "queue_worker_in_flight_messages",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .set(count as f64);
    }

    /// Record a broker (re)connection
    pub fn connected(&self) {
        counter!(
            "queue_worker_connections_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = QueueMetrics::new("mail", "MailProcessor");
        assert_eq!(metrics.queue, "mail");
        assert_eq!(metrics.processor, "MailProcessor");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = QueueMetrics::new("mail", "MailProcessor");
        metrics.message_received();
        metrics.message_settled(&Disposition::Ack, Duration::from_millis(5));
        metrics.in_flight(0);
    }
}
