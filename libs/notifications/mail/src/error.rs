//! Mail pipeline errors
//!
//! Every variant except [`MailError::TemplateStore`] is permanent: retrying the
//! same payload cannot succeed.

use queue_worker::{ErrorCategory, ProcessingError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    /// Payload is not a JSON object with the expected field types
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// `template_name` is not a registered template
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// Recipient is not a valid address. Carries the reason, never the address.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// A variable the template requires is absent
    #[error("Missing variable '{variable}' for template {template}")]
    MissingVariable { template: String, variable: String },

    /// The store has no asset for the template
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// The template could not be rendered with the merged variables
    #[error("Render error: {0}")]
    RenderError(String),

    /// The template store failed to read an existing asset
    #[error("Template store error: {0}")]
    TemplateStore(String),
}

impl MailError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MailError::TemplateStore(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Pipeline stage the error belongs to, for logs
    pub fn stage(&self) -> &'static str {
        match self {
            MailError::MalformedPayload(_)
            | MailError::UnknownTemplate(_)
            | MailError::InvalidRecipient(_)
            | MailError::MissingVariable { .. } => "validation",
            MailError::TemplateNotFound(_)
            | MailError::RenderError(_)
            | MailError::TemplateStore(_) => "rendering",
        }
    }
}

impl From<MailError> for ProcessingError {
    fn from(err: MailError) -> Self {
        match err.category() {
            ErrorCategory::Transient => ProcessingError::transient(err.to_string()),
            ErrorCategory::Permanent => ProcessingError::permanent(err.to_string()),
        }
    }
}
