//! Queue processor: validate, render, dispatch.

use crate::dispatcher::{DeliveryOutcome, MailDispatcher};
use crate::error::MailError;
use crate::request::MailRequest;
use crate::templates::TemplateRenderer;
use async_trait::async_trait;
use metrics::{counter, histogram};
use queue_worker::{MessageProcessor, ProcessingError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Processes mail requests from the queue
pub struct MailProcessor {
    renderer: TemplateRenderer,
    dispatcher: Arc<dyn MailDispatcher>,
    dispatch_timeout: Duration,
}

impl MailProcessor {
    pub fn new(
        renderer: TemplateRenderer,
        dispatcher: Arc<dyn MailDispatcher>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            dispatcher,
            dispatch_timeout,
        }
    }

    /// Render and dispatch a validated request.
    ///
    /// A dispatch that exceeds the timeout is a transient failure.
    pub async fn deliver(&self, request: &MailRequest) -> Result<DeliveryOutcome, MailError> {
        let rendered = self.renderer.render(request).await?;

        let outcome = match tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher.dispatch(&rendered),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::TransientFailure(format!(
                "dispatch timed out after {}s",
                self.dispatch_timeout.as_secs()
            )),
        };

        Ok(outcome)
    }
}

#[async_trait]
impl MessageProcessor for MailProcessor {
    async fn process(&self, payload: &[u8]) -> Result<(), ProcessingError> {
        let start = Instant::now();

        let request = MailRequest::parse(payload).map_err(|e| {
            warn!(stage = %e.stage(), error = %e, "Rejecting invalid mail request");
            counter!("mail_requests_invalid_total", "stage" => e.stage()).increment(1);
            ProcessingError::from(e)
        })?;

        let template = request.template_name();
        let domain = request.recipient_domain();

        let outcome = self.deliver(&request).await.map_err(|e| {
            warn!(
                template = %template,
                recipient_domain = %domain,
                stage = %e.stage(),
                error = %e,
                "Failed to render mail"
            );
            counter!("mail_requests_invalid_total", "stage" => e.stage()).increment(1);
            ProcessingError::from(e)
        })?;

        let elapsed = start.elapsed();
        counter!(
            "mail_dispatch_total",
            "template" => template.to_string(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("mail_dispatch_duration_seconds", "template" => template.to_string())
            .record(elapsed.as_secs_f64());

        match outcome {
            DeliveryOutcome::Delivered => {
                info!(
                    template = %template,
                    recipient_domain = %domain,
                    dispatcher = %self.dispatcher.name(),
                    duration_ms = %elapsed.as_millis(),
                    "Mail delivered"
                );
                Ok(())
            }
            DeliveryOutcome::TransientFailure(reason) => {
                warn!(
                    template = %template,
                    recipient_domain = %domain,
                    stage = "dispatch",
                    reason = %reason,
                    duration_ms = %elapsed.as_millis(),
                    "Transient delivery failure"
                );
                Err(ProcessingError::transient(format!(
                    "transient delivery failure: {reason}"
                )))
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                warn!(
                    template = %template,
                    recipient_domain = %domain,
                    stage = "dispatch",
                    reason = %reason,
                    duration_ms = %elapsed.as_millis(),
                    "Permanent delivery failure"
                );
                Err(ProcessingError::permanent(format!(
                    "permanent delivery failure: {reason}"
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        "MailProcessor"
    }

    async fn shutdown(&self) {
        self.dispatcher.close().await;
    }
}
