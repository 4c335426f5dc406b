//! Transactional mail library
//!
//! Turns queue payloads into delivered HTML mail:
//!
//! - `request`: payload validation into an immutable `MailRequest`
//! - `branding`: process-wide branding defaults and per-request overrides
//! - `templates`: template stores and the Handlebars renderer
//! - `dispatcher`: SMTP and dry-run dispatchers with delivery classification
//! - `processor`: `MailProcessor`, the `queue_worker::MessageProcessor` tying it together

pub mod branding;
pub mod dispatcher;
pub mod error;
pub mod processor;
pub mod request;
pub mod templates;

pub use branding::{BrandingConfig, BrandingOverride};
pub use dispatcher::{
    DeliveryOutcome, DryRunDispatcher, MailDispatcher, SmtpConfig, SmtpDispatcher, TlsMode,
};
pub use error::MailError;
pub use processor::MailProcessor;
pub use request::{MailRequest, TemplateName};
pub use templates::{
    EmbeddedTemplateStore, FsTemplateStore, RenderedMessage, TemplateRenderer, TemplateStore,
};
