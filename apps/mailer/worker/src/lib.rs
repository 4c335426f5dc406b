//! Mail Worker Service
//!
//! Consumes transactional mail requests from RabbitMQ and delivers them over SMTP.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue (RABBITMQ_MAIL_QUEUE_NAME)
//!   ↓ (prefetch = WORKER_CONCURRENCY)
//! QueueWorker<MailProcessor>
//!   ↓ (validates payload, renders template)
//! TemplateRenderer (Handlebars)
//!   ↓ (submits message)
//! MailDispatcher (SMTP or dry run)
//!   ↓
//! ack / reject / requeue with x-retry-count
//! ```
//!
//! ## Features
//!
//! - Bounded concurrency with prefetch matched to the worker pool
//! - Redelivery with exponential backoff, capped by MAX_RETRIES
//! - Reconnect after broker loss
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Optional Prometheus endpoint on METRICS_PORT

use core_config::amqp::AmqpConfig;
use core_config::{ConfigError, Environment, FromEnv, env_flag, env_optional, env_parse_optional, env_parse_or};
use eyre::{Result, WrapErr};
use mail::{
    BrandingConfig, DryRunDispatcher, EmbeddedTemplateStore, FsTemplateStore, MailDispatcher,
    MailProcessor, SmtpConfig, SmtpDispatcher, TemplateRenderer, TemplateStore,
};
use queue_worker::{QueueWorker, WorkerConfig, init_metrics};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Everything the worker reads from the environment
#[derive(Debug)]
pub struct Settings {
    pub amqp: AmqpConfig,
    pub worker: WorkerConfig,
    pub branding: BrandingConfig,
    /// `None` in dry-run mode
    pub smtp: Option<SmtpConfig>,
    pub templates_dir: Option<PathBuf>,
    pub dispatch_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl Settings {
    pub fn dry_run(&self) -> bool {
        self.smtp.is_none()
    }
}

impl FromEnv for Settings {
    fn from_env() -> Result<Self, ConfigError> {
        let smtp = if env_flag("DRY_RUN") {
            None
        } else {
            Some(SmtpConfig::from_env()?)
        };

        Ok(Self {
            amqp: AmqpConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            branding: BrandingConfig::from_env()?,
            smtp,
            templates_dir: env_optional("EMAIL_TEMPLATES_DIR").map(PathBuf::from),
            dispatch_timeout: Duration::from_secs(env_parse_or("DISPATCH_TIMEOUT_SECS", 30)?),
            metrics_port: env_parse_optional("METRICS_PORT")?,
        })
    }
}

/// Templates come from EMAIL_TEMPLATES_DIR when set, embedded assets otherwise
pub fn template_store(settings: &Settings) -> Arc<dyn TemplateStore> {
    match &settings.templates_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Loading templates from directory");
            Arc::new(FsTemplateStore::new(dir.clone()))
        }
        None => Arc::new(EmbeddedTemplateStore),
    }
}

/// SMTP dispatcher with one pooled session per worker slot, or the dry-run recorder
pub fn dispatcher(settings: &Settings) -> Result<Arc<dyn MailDispatcher>> {
    match &settings.smtp {
        Some(smtp) => {
            let config = smtp.clone().with_pool_size(settings.worker.concurrency as u32);
            let dispatcher =
                SmtpDispatcher::new(config).wrap_err("Failed to configure SMTP dispatcher")?;
            Ok(Arc::new(dispatcher))
        }
        None => {
            warn!("DRY_RUN enabled, mail will be rendered but not sent");
            Ok(Arc::new(DryRunDispatcher::new()))
        }
    }
}

/// Run the mail worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads broker, worker, branding and SMTP configuration
/// 3. Builds the render and dispatch pipeline
/// 4. Consumes the queue until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if:
/// - A required environment variable is missing or malformed
/// - The SMTP transport cannot be configured
/// - The broker stays unreachable past the connect retries
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting mail worker service"
    );
    info!("Environment: {:?}", environment);

    let settings = Settings::from_env().wrap_err("Failed to load configuration")?;
    info!(
        broker = %settings.amqp.redacted_uri(),
        queue = %settings.amqp.queue,
        consumer_tag = %settings.worker.consumer_tag,
        concurrency = settings.worker.concurrency,
        max_retries = settings.worker.retry.max_retries,
        dry_run = settings.dry_run(),
        "Worker configuration loaded"
    );

    if let Some(port) = settings.metrics_port {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        init_metrics(addr).wrap_err("Failed to start metrics exporter")?;
        info!(port, "Prometheus metrics listening");
    }

    let renderer = TemplateRenderer::new(template_store(&settings), settings.branding.clone());
    let processor = MailProcessor::new(renderer, dispatcher(&settings)?, settings.dispatch_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let worker = QueueWorker::new(processor, settings.worker, settings.amqp);
    worker.run(shutdown_rx).await.wrap_err("Mail worker failed")?;

    info!("Mail worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
