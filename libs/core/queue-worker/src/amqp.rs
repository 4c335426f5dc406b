//! AMQP (RabbitMQ) session and message settlement over lapin.

use crate::error::QueueError;
use crate::message::{InboundMessage, RETRY_HEADER};
use crate::policy::Disposition;
use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Read the requeue counter from message headers. Missing or unreadable means 0.
pub fn retry_count(headers: &Option<FieldTable>) -> u32 {
    let Some(table) = headers else {
        return 0;
    };

    let value = table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == RETRY_HEADER)
        .map(|(_, value)| value);

    let count: Option<i64> = match value {
        Some(AMQPValue::ShortShortUInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::ShortShortInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::ShortUInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::ShortInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::LongUInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::LongInt(v)) => Some(i64::from(*v)),
        Some(AMQPValue::LongLongInt(v)) => Some(*v),
        Some(AMQPValue::LongString(s)) => std::str::from_utf8(s.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    };

    count
        .and_then(|c| u32::try_from(c.max(0)).ok())
        .unwrap_or(0)
}

/// Copy of `headers` with the requeue counter set to `attempt`
pub fn with_retry_count(headers: &Option<FieldTable>, attempt: u32) -> FieldTable {
    let mut table = headers.clone().unwrap_or_default();
    table.insert(
        ShortString::from(RETRY_HEADER),
        AMQPValue::LongLongInt(i64::from(attempt)),
    );
    table
}

/// A delivery plus the channel needed to settle it
pub struct AmqpMessage {
    delivery: Delivery,
    channel: Channel,
    queue: String,
    attempt: u32,
}

impl AmqpMessage {
    pub fn new(delivery: Delivery, channel: Channel, queue: String) -> Self {
        let attempt = retry_count(delivery.properties.headers());
        Self {
            delivery,
            channel,
            queue,
            attempt,
        }
    }

    async fn publish_copy(&self, attempt: u32) -> Result<(), QueueError> {
        let headers = with_retry_count(self.delivery.properties.headers(), attempt);
        let properties = self.delivery.properties.clone().with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &self.delivery.data,
                properties,
            )
            .await?
            .await?;

        if matches!(confirmation, Confirmation::Nack(_)) {
            return Err(QueueError::Republish("broker nacked the publish".into()));
        }
        Ok(())
    }
}

/// Broker operations needed to settle one delivery
#[async_trait]
trait Settlement: Send + Sync {
    fn tag(&self) -> u64;

    /// Whether the broker has delivered this message before
    fn redelivered(&self) -> bool;

    async fn ack(&self) -> Result<(), QueueError>;

    /// `basic.reject` without requeue, dead-lettered if the queue has a DLX
    async fn reject(&self) -> Result<(), QueueError>;

    /// `basic.nack` with requeue, the broker redelivers it unchanged
    async fn nack_requeue(&self) -> Result<(), QueueError>;

    /// Publish a copy carrying `attempt` and wait for the broker's confirm
    async fn republish(&self, attempt: u32) -> Result<(), QueueError>;
}

/// Apply a disposition.
///
/// A requeue copy that cannot be published returns the delivery to the broker once.
/// If it was already redelivered it is rejected instead, otherwise a broker that keeps
/// refusing publishes would cycle the same attempt forever.
async fn settle_with<S>(target: &S, disposition: &Disposition) -> Result<(), QueueError>
where
    S: Settlement + ?Sized,
{
    match disposition {
        Disposition::Ack => target.ack().await,
        Disposition::Reject => target.reject().await,
        Disposition::Requeue { attempt, .. } => match target.republish(*attempt).await {
            Ok(()) => target.ack().await,
            Err(e) if target.redelivered() => {
                warn!(
                    delivery_tag = %target.tag(),
                    error = %e,
                    "Republish failed again on a redelivered message, rejecting"
                );
                target.reject().await
            }
            Err(e) => {
                warn!(
                    delivery_tag = %target.tag(),
                    error = %e,
                    "Republish failed, returning message to the broker"
                );
                target.nack_requeue().await
            }
        },
    }
}

#[async_trait]
impl Settlement for AmqpMessage {
    fn tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), QueueError> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    async fn nack_requeue(&self) -> Result<(), QueueError> {
        self.delivery
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await?;
        Ok(())
    }

    async fn republish(&self, attempt: u32) -> Result<(), QueueError> {
        self.publish_copy(attempt).await
    }
}

#[async_trait]
impl InboundMessage for AmqpMessage {
    fn tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn settle(self, disposition: &Disposition) -> Result<(), QueueError> {
        settle_with(&self, disposition).await
    }
}

/// An open connection and channel bound to one queue
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpSession {
    /// Connect once: open a channel, enable publisher confirms, set prefetch and
    /// check the queue exists with a passive declare.
    pub async fn connect(config: &AmqpConfig, prefetch: u16) -> Result<Self, QueueError> {
        let connection =
            Connection::connect(&config.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::QueueUnavailable {
                queue: config.queue.clone(),
                source,
            })?;

        Ok(Self {
            connection,
            channel,
            queue: config.queue.clone(),
        })
    }

    /// Connect with the configured number of attempts and delay between them.
    ///
    /// Returns `Ok(None)` when shutdown is requested while waiting.
    pub async fn connect_with_retry(
        config: &AmqpConfig,
        prefetch: u16,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Self>, QueueError> {
        let attempts = config.connect_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if *shutdown.borrow() {
                return Ok(None);
            }

            match Self::connect(config, prefetch).await {
                Ok(session) => {
                    info!(
                        broker = %config.redacted_uri(),
                        queue = %config.queue,
                        prefetch = %prefetch,
                        "Connected to broker"
                    );
                    return Ok(Some(session));
                }
                Err(e) => {
                    warn!(
                        attempt = %attempt,
                        max_attempts = %attempts,
                        broker = %config.redacted_uri(),
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(None),
                    _ = tokio::time::sleep(config.connect_retry_delay) => {}
                }
            }
        }

        Err(QueueError::ConnectRetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Start consuming. The stream ends or yields an error when the connection drops.
    pub async fn consume(
        &self,
        consumer_tag: &str,
    ) -> Result<impl Stream<Item = Result<AmqpMessage, QueueError>> + Send + Unpin + use<>, QueueError>
    {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let channel = self.channel.clone();
        let queue = self.queue.clone();
        Ok(consumer.map(move |delivery| {
            delivery
                .map(|d| AmqpMessage::new(d, channel.clone(), queue.clone()))
                .map_err(QueueError::from)
        }))
    }

    /// Stop receiving new deliveries. In-flight messages can still be settled.
    pub async fn cancel(&self, consumer_tag: &str) {
        if let Err(e) = self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            debug!(error = %e, "Failed to cancel consumer");
        }
    }

    /// Close the channel and the connection.
    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "worker shutdown").await {
            debug!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close(200, "worker shutdown").await {
            debug!(error = %e, "Failed to close connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records broker calls; republish succeeds or fails as configured
    struct RecordingDelivery {
        redelivered: bool,
        republish_fails: bool,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDelivery {
        fn new(redelivered: bool, republish_fails: bool) -> Self {
            Self {
                redelivered,
                republish_fails,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Settlement for RecordingDelivery {
        fn tag(&self) -> u64 {
            1
        }

        fn redelivered(&self) -> bool {
            self.redelivered
        }

        async fn ack(&self) -> Result<(), QueueError> {
            self.record("ack");
            Ok(())
        }

        async fn reject(&self) -> Result<(), QueueError> {
            self.record("reject");
            Ok(())
        }

        async fn nack_requeue(&self) -> Result<(), QueueError> {
            self.record("nack_requeue");
            Ok(())
        }

        async fn republish(&self, attempt: u32) -> Result<(), QueueError> {
            self.record(format!("republish:{attempt}"));
            if self.republish_fails {
                Err(QueueError::Republish("broker nacked the publish".into()))
            } else {
                Ok(())
            }
        }
    }

    fn requeue(attempt: u32) -> Disposition {
        Disposition::Requeue {
            attempt,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_settle_ack_and_reject() {
        let delivery = RecordingDelivery::new(false, false);
        settle_with(&delivery, &Disposition::Ack).await.unwrap();
        settle_with(&delivery, &Disposition::Reject).await.unwrap();
        assert_eq!(delivery.calls(), ["ack", "reject"]);
    }

    #[tokio::test]
    async fn test_requeue_acks_after_confirmed_republish() {
        let delivery = RecordingDelivery::new(false, false);
        settle_with(&delivery, &requeue(3)).await.unwrap();
        assert_eq!(delivery.calls(), ["republish:3", "ack"]);
    }

    #[tokio::test]
    async fn test_failed_republish_returns_first_delivery_to_broker() {
        let delivery = RecordingDelivery::new(false, true);
        settle_with(&delivery, &requeue(1)).await.unwrap();
        assert_eq!(delivery.calls(), ["republish:1", "nack_requeue"]);
    }

    #[tokio::test]
    async fn test_failed_republish_rejects_redelivered_message() {
        let delivery = RecordingDelivery::new(true, true);
        settle_with(&delivery, &requeue(1)).await.unwrap();
        assert_eq!(delivery.calls(), ["republish:1", "reject"]);
    }

    #[tokio::test]
    async fn test_refused_republish_is_bounded() {
        // the broker keeps refusing publishes: one return, then dead-letter
        let first = RecordingDelivery::new(false, true);
        settle_with(&first, &requeue(2)).await.unwrap();
        assert_eq!(first.calls().last().map(String::as_str), Some("nack_requeue"));

        let redelivered = RecordingDelivery::new(true, true);
        settle_with(&redelivered, &requeue(2)).await.unwrap();
        assert_eq!(
            redelivered.calls().last().map(String::as_str),
            Some("reject")
        );
    }

    fn headers(value: AMQPValue) -> Option<FieldTable> {
        let mut table = FieldTable::default();
        table.insert(ShortString::from(RETRY_HEADER), value);
        Some(table)
    }

    #[test]
    fn test_retry_count_missing_headers() {
        assert_eq!(retry_count(&None), 0);
        assert_eq!(retry_count(&Some(FieldTable::default())), 0);
    }

    #[test]
    fn test_retry_count_integer_variants() {
        assert_eq!(retry_count(&headers(AMQPValue::LongLongInt(3))), 3);
        assert_eq!(retry_count(&headers(AMQPValue::LongUInt(2))), 2);
        assert_eq!(retry_count(&headers(AMQPValue::ShortShortUInt(1))), 1);
        assert_eq!(retry_count(&headers(AMQPValue::LongInt(-4))), 0);
    }

    #[test]
    fn test_retry_count_numeric_string() {
        let value = AMQPValue::LongString(LongString::from("4"));
        assert_eq!(retry_count(&headers(value)), 4);

        let garbage = AMQPValue::LongString(LongString::from("four"));
        assert_eq!(retry_count(&headers(garbage)), 0);
    }

    #[test]
    fn test_with_retry_count_preserves_other_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("x-request-id"),
            AMQPValue::LongString(LongString::from("abc")),
        );
        let updated = with_retry_count(&Some(table), 2);

        assert_eq!(retry_count(&Some(updated.clone())), 2);
        assert!(updated
            .inner()
            .iter()
            .any(|(k, _)| k.as_str() == "x-request-id"));
    }

    #[test]
    fn test_with_retry_count_overwrites_previous_value() {
        let updated = with_retry_count(&headers(AMQPValue::LongLongInt(1)), 2);
        assert_eq!(retry_count(&Some(updated)), 2);
    }
}
