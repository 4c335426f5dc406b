use crate::error::MailError;
use crate::request::TemplateName;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// HTML source plus default variable values for one template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateAsset {
    pub html: String,
    pub defaults: BTreeMap<String, String>,
}

/// Template store trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Load the asset for a template
    async fn load(&self, name: TemplateName) -> Result<TemplateAsset, MailError>;
}

/// Parse a JSON defaults document into string variables.
///
/// Non-string scalars are stringified; nested values are rejected.
pub fn parse_defaults(name: TemplateName, json: &str) -> Result<BTreeMap<String, String>, MailError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| MailError::RenderError(format!("invalid defaults for {name}: {e}")))?;

    let Value::Object(fields) = value else {
        return Err(MailError::RenderError(format!(
            "defaults for {name} must be a JSON object"
        )));
    };

    fields
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            Value::Number(n) => Ok((key, n.to_string())),
            Value::Bool(b) => Ok((key, b.to_string())),
            Value::Null => Ok((key, String::new())),
            _ => Err(MailError::RenderError(format!(
                "default '{key}' for {name} must be a scalar"
            ))),
        })
        .collect()
}

/// Built-in assets compiled into the binary
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedTemplateStore;

impl EmbeddedTemplateStore {
    fn sources(name: TemplateName) -> (&'static str, &'static str) {
        match name {
            TemplateName::EmailVerification => (
                include_str!("../../templates/email_verification.html"),
                include_str!("../../templates/email_verification.json"),
            ),
            TemplateName::EmailChangeVerification => (
                include_str!("../../templates/email_change_verification.html"),
                include_str!("../../templates/email_change_verification.json"),
            ),
            TemplateName::ForgotPasswordVerification => (
                include_str!("../../templates/forgot_password_verification.html"),
                include_str!("../../templates/forgot_password_verification.json"),
            ),
        }
    }
}

#[async_trait]
impl TemplateStore for EmbeddedTemplateStore {
    async fn load(&self, name: TemplateName) -> Result<TemplateAsset, MailError> {
        let (html, defaults) = Self::sources(name);
        Ok(TemplateAsset {
            html: html.to_string(),
            defaults: parse_defaults(name, defaults)?,
        })
    }
}

/// Templates from a directory of `<name>.html` and optional `<name>.json` files.
///
/// A file in the directory overrides the built-in HTML; JSON defaults are merged
/// over the built-in defaults. In strict mode there is no built-in fallback.
#[derive(Debug, Clone)]
pub struct FsTemplateStore {
    dir: PathBuf,
    fallback: Option<EmbeddedTemplateStore>,
}

impl FsTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        info!(templates_dir = %dir.display(), "Using custom email templates directory");
        Self {
            dir,
            fallback: Some(EmbeddedTemplateStore),
        }
    }

    /// Only serve templates present in the directory
    pub fn strict(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_optional(&self, file: &str) -> Result<Option<String>, MailError> {
        let path = self.dir.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                debug!(path = %path.display(), "Loaded template file");
                Ok(Some(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MailError::TemplateStore(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl TemplateStore for FsTemplateStore {
    async fn load(&self, name: TemplateName) -> Result<TemplateAsset, MailError> {
        let base = match &self.fallback {
            Some(embedded) => Some(embedded.load(name).await?),
            None => None,
        };

        let html = self
            .read_optional(&format!("{}.html", name.asset_name()))
            .await?;
        let custom_defaults = self
            .read_optional(&format!("{}.json", name.asset_name()))
            .await?;

        let (html, mut defaults) = match (html, base) {
            (Some(html), Some(base)) => (html, base.defaults),
            (Some(html), None) => (html, BTreeMap::new()),
            (None, Some(base)) => (base.html, base.defaults),
            (None, None) => return Err(MailError::TemplateNotFound(name.to_string())),
        };

        if let Some(json) = custom_defaults {
            defaults.extend(parse_defaults(name, &json)?);
        }

        Ok(TemplateAsset { html, defaults })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[tokio::test]
    async fn test_embedded_store_has_every_template() {
        let store = EmbeddedTemplateStore;
        for name in TemplateName::iter() {
            let asset = store.load(name).await.unwrap();
            assert!(asset.html.contains("{{verification_code}}"), "{name}");
            assert_eq!(asset.defaults["language"], "en");
        }
    }

    #[tokio::test]
    async fn test_fs_store_overrides_html_and_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("email_verification.html"),
            "<p>{{greeting}} {{verification_code}}</p>",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("email_verification.json"),
            r#"{ "language": "de", "greeting": "Hallo {username}," }"#,
        )
        .unwrap();

        let asset = FsTemplateStore::new(dir.path())
            .load(TemplateName::EmailVerification)
            .await
            .unwrap();

        assert_eq!(asset.html, "<p>{{greeting}} {{verification_code}}</p>");
        assert_eq!(asset.defaults["language"], "de");
        assert_eq!(asset.defaults["greeting"], "Hallo {username},");
        // untouched built-in default survives the merge
        assert!(asset.defaults.contains_key("expiry_notice"));
    }

    #[tokio::test]
    async fn test_fs_store_falls_back_to_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let asset = FsTemplateStore::new(dir.path())
            .load(TemplateName::ForgotPasswordVerification)
            .await
            .unwrap();
        let embedded = EmbeddedTemplateStore
            .load(TemplateName::ForgotPasswordVerification)
            .await
            .unwrap();
        assert_eq!(asset, embedded);
    }

    #[tokio::test]
    async fn test_strict_store_reports_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsTemplateStore::strict(dir.path())
            .load(TemplateName::EmailChangeVerification)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MailError::TemplateNotFound("email_change_verification".into())
        );
    }

    #[test]
    fn test_parse_defaults_rejects_nested_values() {
        let err = parse_defaults(TemplateName::EmailVerification, r#"{ "a": { "b": "c" } }"#)
            .unwrap_err();
        assert!(matches!(err, MailError::RenderError(_)));

        let ok = parse_defaults(TemplateName::EmailVerification, r#"{ "n": 3, "b": true }"#)
            .unwrap();
        assert_eq!(ok["n"], "3");
        assert_eq!(ok["b"], "true");
    }
}
