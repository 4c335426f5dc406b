//! Email template management with Handlebars
//!
//! This module provides:
//! - `TemplateStore` trait with embedded and directory-backed stores
//! - `TemplateRenderer`: merges defaults, branding and request variables
//! - Single-brace reference resolution between variables

mod references;
mod renderer;
mod store;

pub use references::{resolve_references, MAX_REFERENCE_PASSES};
pub use renderer::{RenderedMessage, TemplateRenderer};
pub use store::{parse_defaults, EmbeddedTemplateStore, FsTemplateStore, TemplateAsset, TemplateStore};

#[cfg(test)]
pub use store::MockTemplateStore;
