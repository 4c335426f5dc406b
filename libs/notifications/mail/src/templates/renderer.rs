use super::references::resolve_references;
use super::store::TemplateStore;
use crate::branding::BrandingConfig;
use crate::error::MailError;
use crate::request::MailRequest;
use handlebars::Handlebars;
use lettre::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output of rendering, consumed by a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub recipient: Address,
    pub subject: String,
    pub html_body: String,
}

/// Handlebars-based renderer.
///
/// Strict mode: every `{{placeholder}}` must resolve from the merged variables.
/// Values are HTML-escaped.
pub struct TemplateRenderer {
    store: Arc<dyn TemplateStore>,
    branding: BrandingConfig,
    handlebars: Handlebars<'static>,
}

impl TemplateRenderer {
    pub fn new(store: Arc<dyn TemplateStore>, branding: BrandingConfig) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);

        Self {
            store,
            branding,
            handlebars,
        }
    }

    pub fn branding(&self) -> &BrandingConfig {
        &self.branding
    }

    /// Merged variables, lowest precedence first: template defaults,
    /// effective branding, request variables. References are resolved.
    pub fn variables(
        &self,
        defaults: BTreeMap<String, String>,
        request: &MailRequest,
    ) -> BTreeMap<String, String> {
        let mut merged = defaults;
        merged.extend(
            self.branding
                .merged(request.branding())
                .to_variables(),
        );
        merged.extend(
            request
                .variables()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        resolve_references(&merged)
    }

    pub async fn render(&self, request: &MailRequest) -> Result<RenderedMessage, MailError> {
        let template = request.template_name();
        let asset = self.store.load(template).await?;
        let variables = self.variables(asset.defaults, request);

        let html_body = self
            .handlebars
            .render_template(&asset.html, &variables)
            .map_err(|e| MailError::RenderError(format!("{template}: {e}")))?;

        Ok(RenderedMessage {
            recipient: request.recipient().clone(),
            subject: template.subject().to_string(),
            html_body,
        })
    }
}
