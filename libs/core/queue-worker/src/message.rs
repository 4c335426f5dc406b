use crate::error::QueueError;
use crate::policy::Disposition;
use async_trait::async_trait;

/// Header carrying how many times a message has been requeued
pub const RETRY_HEADER: &str = "x-retry-count";

/// A message received from the broker, settled exactly once.
#[async_trait]
pub trait InboundMessage: Send + Sync + 'static {
    /// Broker delivery tag, for logging
    fn tag(&self) -> u64;

    /// Raw message body
    fn payload(&self) -> &[u8];

    /// Number of times this message has been requeued so far
    fn attempt(&self) -> u32;

    /// Apply the disposition. Consumes the message so it cannot be settled twice.
    async fn settle(self, disposition: &Disposition) -> Result<(), QueueError>;
}
