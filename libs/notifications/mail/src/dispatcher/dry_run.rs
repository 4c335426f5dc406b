//! Dispatcher that logs and records messages instead of sending them

use super::{DeliveryOutcome, MailDispatcher};
use crate::templates::RenderedMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Records every message it is given and reports it delivered
#[derive(Clone, Default)]
pub struct DryRunDispatcher {
    sent: Arc<Mutex<Vec<RenderedMessage>>>,
}

impl DryRunDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded messages
    pub async fn sent(&self) -> Vec<RenderedMessage> {
        self.sent.lock().await.clone()
    }

    /// Get the count of recorded messages
    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl MailDispatcher for DryRunDispatcher {
    async fn dispatch(&self, message: &RenderedMessage) -> DeliveryOutcome {
        info!(
            recipient_domain = %message.recipient.domain(),
            subject = %message.subject,
            body_bytes = %message.html_body.len(),
            "Dry run: mail not sent"
        );
        self.sent.lock().await.push(message.clone());
        DeliveryOutcome::Delivered
    }

    fn name(&self) -> &'static str {
        "dry_run"
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_messages() {
        let dispatcher = DryRunDispatcher::new();
        let message = RenderedMessage {
            recipient: "user@example.com".parse().unwrap(),
            subject: "Verify your email address".into(),
            html_body: "<p>123456</p>".into(),
        };

        assert_eq!(dispatcher.dispatch(&message).await, DeliveryOutcome::Delivered);
        assert_eq!(dispatcher.sent_count().await, 1);
        assert_eq!(dispatcher.sent().await[0], message);
    }
}
