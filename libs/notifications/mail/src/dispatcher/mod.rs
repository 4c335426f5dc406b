//! Mail dispatcher implementations

pub mod dry_run;
pub mod smtp;

pub use dry_run::DryRunDispatcher;
pub use smtp::{SmtpConfig, SmtpDispatcher, TlsMode, TransportFault};

use crate::templates::RenderedMessage;
use async_trait::async_trait;

/// Result of one submission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the transport server
    Delivered,
    /// Worth retrying later (network, timeout, 4xx)
    TransientFailure(String),
    /// Retrying cannot help (auth, malformed envelope, 5xx)
    PermanentFailure(String),
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::TransientFailure(_) => "transient_failure",
            DeliveryOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// Trait for mail dispatchers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    /// Submit one message. Never retries internally.
    async fn dispatch(&self, message: &RenderedMessage) -> DeliveryOutcome;

    /// Get dispatcher name
    fn name(&self) -> &'static str;

    /// Release transport sessions
    async fn close(&self);
}
