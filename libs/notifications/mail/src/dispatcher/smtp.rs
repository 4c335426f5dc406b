//! SMTP dispatcher using lettre's pooled async transport

use super::{DeliveryOutcome, MailDispatcher};
use crate::templates::RenderedMessage;
use async_trait::async_trait;
use core_config::{env_or_default, env_parse_or, env_required, ConfigError, FromEnv};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// How the session is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS (submission port 587)
    #[strum(serialize = "starttls")]
    StartTls,
    /// Implicit TLS (port 465)
    Tls,
    /// No encryption, local relays and test servers only
    None,
}

/// SMTP dispatcher configuration
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub tls: TlsMode,
    /// Per-command transport timeout
    pub timeout: Duration,
    /// Maximum pooled sessions
    pub pool_size: u32,
}

impl SmtpConfig {
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("from_email", &self.from_email)
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl FromEnv for SmtpConfig {
    /// Requires SMTP_USER and SMTP_PASSWORD. The sender defaults to SMTP_USER.
    fn from_env() -> Result<Self, ConfigError> {
        let username = env_required("SMTP_USER")?;
        Ok(Self {
            host: env_or_default("SMTP_SERVER", "localhost"),
            port: env_parse_or("SMTP_PORT", 587)?,
            password: env_required("SMTP_PASSWORD")?,
            from_email: env_or_default("SMTP_FROM_EMAIL", &username),
            username,
            tls: env_parse_or("SMTP_TLS", TlsMode::StartTls)?,
            timeout: Duration::from_secs(env_parse_or("DISPATCH_TIMEOUT_SECS", 30)?),
            pool_size: 4,
        })
    }
}

/// Errors building the transport
#[derive(Error, Debug)]
pub enum SmtpSetupError {
    #[error("Invalid sender address: {0}")]
    InvalidSender(#[from] lettre::address::AddressError),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Kind of transport failure, the input to delivery classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// No response in time
    Timeout,
    /// Connection refused, reset or dropped
    Network,
    /// TLS handshake or certificate failure
    Tls,
    /// 4xx reply
    TransientResponse,
    /// 5xx reply, including rejected credentials
    PermanentResponse,
    /// Malformed envelope or unsupported authentication
    Client,
}

impl TransportFault {
    pub fn from_error(err: &lettre::transport::smtp::Error) -> Self {
        if err.is_timeout() {
            TransportFault::Timeout
        } else if err.is_permanent() {
            TransportFault::PermanentResponse
        } else if err.is_transient() {
            TransportFault::TransientResponse
        } else if err.is_client() {
            TransportFault::Client
        } else if err.is_tls() {
            TransportFault::Tls
        } else {
            TransportFault::Network
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TransportFault::Timeout
            | TransportFault::Network
            | TransportFault::Tls
            | TransportFault::TransientResponse => true,
            TransportFault::PermanentResponse | TransportFault::Client => false,
        }
    }

    /// Map a fault to a delivery outcome
    pub fn outcome(&self, detail: impl fmt::Display) -> DeliveryOutcome {
        let reason = format!("{self:?}: {detail}");
        if self.is_transient() {
            DeliveryOutcome::TransientFailure(reason)
        } else {
            DeliveryOutcome::PermanentFailure(reason)
        }
    }
}

/// SMTP dispatcher
pub struct SmtpDispatcher {
    transport: RwLock<Option<AsyncSmtpTransport<Tokio1Executor>>>,
    from: Mailbox,
    endpoint: String,
}

impl SmtpDispatcher {
    /// Create a new SMTP dispatcher. Sessions are opened lazily by the pool.
    pub fn new(config: SmtpConfig) -> Result<Self, SmtpSetupError> {
        let from: Mailbox = config.from_email.parse()?;

        let builder = match config.tls {
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(config.timeout))
            .pool_config(PoolConfig::new().max_size(config.pool_size));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        info!(
            host = %config.host,
            port = %config.port,
            tls = %config.tls,
            pool_size = %config.pool_size,
            "SMTP dispatcher configured"
        );

        Ok(Self {
            transport: RwLock::new(Some(builder.build())),
            from,
            endpoint: format!("{}:{}", config.host, config.port),
        })
    }

    fn build_message(&self, message: &RenderedMessage) -> Result<Message, lettre::error::Error> {
        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, message.recipient.clone()))
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(message.html_body.clone())
    }
}

#[async_trait]
impl MailDispatcher for SmtpDispatcher {
    async fn dispatch(&self, message: &RenderedMessage) -> DeliveryOutcome {
        let email = match self.build_message(message) {
            Ok(email) => email,
            Err(e) => return TransportFault::Client.outcome(e),
        };

        let Some(transport) = self.transport.read().await.clone() else {
            return DeliveryOutcome::TransientFailure("dispatcher is closed".to_string());
        };

        match transport.send(email).await {
            Ok(response) => {
                debug!(
                    endpoint = %self.endpoint,
                    code = %response.code(),
                    "SMTP server accepted message"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => TransportFault::from_error(&e).outcome(e),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn close(&self) {
        if self.transport.write().await.take().is_some() {
            info!(endpoint = %self.endpoint, "SMTP connection pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: TlsMode) -> SmtpConfig {
        SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            username: "mailer@acme.test".into(),
            password: "secret".into(),
            from_email: "noreply@acme.test".into(),
            tls,
            timeout: Duration::from_secs(5),
            pool_size: 4,
        }
    }

    #[test]
    fn test_classification_is_total() {
        let faults = [
            TransportFault::Timeout,
            TransportFault::Network,
            TransportFault::Tls,
            TransportFault::TransientResponse,
            TransportFault::PermanentResponse,
            TransportFault::Client,
        ];
        for fault in faults {
            let outcome = fault.outcome("detail");
            match outcome {
                DeliveryOutcome::TransientFailure(reason) => {
                    assert!(fault.is_transient());
                    assert!(reason.contains("detail"));
                }
                DeliveryOutcome::PermanentFailure(_) => assert!(!fault.is_transient()),
                DeliveryOutcome::Delivered => panic!("a fault never delivers"),
            }
        }
    }

    #[test]
    fn test_auth_and_5xx_are_permanent() {
        assert!(!TransportFault::PermanentResponse.is_transient());
        assert!(!TransportFault::Client.is_transient());
        assert!(TransportFault::TransientResponse.is_transient());
        assert!(TransportFault::Timeout.is_transient());
    }

    #[test]
    fn test_tls_mode_parsing() {
        assert_eq!("starttls".parse::<TlsMode>().unwrap(), TlsMode::StartTls);
        assert_eq!("TLS".parse::<TlsMode>().unwrap(), TlsMode::Tls);
        assert_eq!("none".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert!("ssl3".parse::<TlsMode>().is_err());
    }

    #[test]
    fn test_from_env_defaults_sender_to_user() {
        temp_env::with_vars(
            [
                ("SMTP_SERVER", None),
                ("SMTP_PORT", None),
                ("SMTP_USER", Some("mailer@acme.test")),
                ("SMTP_PASSWORD", Some("secret")),
                ("SMTP_FROM_EMAIL", None),
                ("SMTP_TLS", None),
                ("DISPATCH_TIMEOUT_SECS", None),
            ],
            || {
                let config = SmtpConfig::from_env().unwrap();
                assert_eq!(config.host, "localhost");
                assert_eq!(config.port, 587);
                assert_eq!(config.from_email, "mailer@acme.test");
                assert_eq!(config.tls, TlsMode::StartTls);
                assert_eq!(config.timeout, Duration::from_secs(30));
                assert!(!format!("{config:?}").contains("secret"));
            },
        );
    }

    #[test]
    fn test_from_env_requires_password() {
        temp_env::with_vars(
            [
                ("SMTP_USER", Some("mailer@acme.test")),
                ("SMTP_PASSWORD", None),
            ],
            || {
                assert!(SmtpConfig::from_env().is_err());
            },
        );
    }

    #[tokio::test]
    async fn test_build_message_and_close() {
        let dispatcher = SmtpDispatcher::new(config(TlsMode::None)).unwrap();
        let message = RenderedMessage {
            recipient: "user@example.com".parse().unwrap(),
            subject: "Verify your email address".into(),
            html_body: "<p>123456</p>".into(),
        };

        let email = dispatcher.build_message(&message).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("To: user@example.com"));
        assert!(raw.contains("Subject: Verify your email address"));
        assert!(raw.contains("text/html"));

        dispatcher.close().await;
        assert!(matches!(
            dispatcher.dispatch(&message).await,
            DeliveryOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn test_invalid_sender_is_rejected() {
        let mut config = config(TlsMode::None);
        config.from_email = "not an address".into();
        assert!(matches!(
            SmtpDispatcher::new(config),
            Err(SmtpSetupError::InvalidSender(_))
        ));
    }
}
