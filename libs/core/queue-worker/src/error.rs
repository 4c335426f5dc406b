//! Queue error types and error categorization
//!
//! Processing errors are categorized to determine the message disposition:
//! - **Transient**: Temporary failure, requeue with exponential backoff
//! - **Permanent**: Unrecoverable, reject without requeue (dead-letter if configured)

use core_config::ConfigError;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure - requeue until the retry budget is spent
    Transient,
    /// Unrecoverable error - reject immediately
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        *self == ErrorCategory::Transient
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Error returned by a [`MessageProcessor`](crate::MessageProcessor)
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Processing failed with a known category
    #[error("{message}")]
    Failed {
        message: String,
        category: ErrorCategory,
    },

    /// Unexpected failure inside the processor
    #[error("Internal error: {0}")]
    Internal(String),

    /// The processor panicked
    #[error("Processor panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        ProcessingError::Failed {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessingError::Failed {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Get the error category. Unexpected errors and panics are transient.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Failed { category, .. } => *category,
            ProcessingError::Internal(_) => ErrorCategory::Transient,
            ProcessingError::Panicked(_) => ErrorCategory::Transient,
        }
    }
}

/// Broker and worker lifecycle errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// AMQP protocol or connection error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The queue does not exist or cannot be accessed
    #[error("Queue '{queue}' is unavailable: {source}")]
    QueueUnavailable {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    /// All connection attempts failed
    #[error("Failed to connect to broker after {attempts} attempts: {last_error}")]
    ConnectRetriesExhausted { attempts: u32, last_error: String },

    /// A requeue could not be published
    #[error("Failed to republish message: {0}")]
    Republish(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ProcessingError::transient("smtp down").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ProcessingError::permanent("bad payload").category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_unexpected_errors_are_transient() {
        assert!(ProcessingError::Internal("boom".into())
            .category()
            .is_retryable());
        assert!(ProcessingError::Panicked("boom".into())
            .category()
            .is_retryable());
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(ErrorCategory::Transient.as_str(), "transient");
        assert_eq!(ErrorCategory::Permanent.as_str(), "permanent");
    }

    #[test]
    fn test_display_keeps_message() {
        let err = ProcessingError::permanent("Unknown template: invoice_receipt");
        assert_eq!(err.to_string(), "Unknown template: invoice_receipt");
    }
}
