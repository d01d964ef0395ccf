//! Email gateway implementations.
//!
//! The dispatch pipeline only sees the [`EmailGateway`] trait: hand it a
//! rendered message, get back the gateway's message identifier or a
//! delivery error.

mod mock;
mod sendgrid;
mod smtp;

pub use mock::MockGateway;
pub use sendgrid::{SendGridConfig, SendGridGateway};
pub use smtp::{SmtpConfig, SmtpGateway};

use async_trait::async_trait;
use core_config::{ConfigError, Environment, FromEnv, env_or_default};
use std::sync::Arc;
use strum::{Display, EnumString};

use crate::error::{NotificationError, NotificationResult};

/// A rendered message addressed to one guardian.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Notification id, echoed back by webhooks.
    pub correlation_id: String,
}

/// What the gateway returns for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub gateway_message_id: Option<String>,
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> NotificationResult<GatewayReceipt>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;

    async fn health_check(&self) -> NotificationResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EmailProviderKind {
    Smtp,
    SendGrid,
    Mock,
}

/// Which gateway to build and how to address mail.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub provider: EmailProviderKind,
    /// Public base URL used for unsubscribe links.
    pub base_url: String,
    pub organisation_name: String,
}

impl FromEnv for EmailConfig {
    /// - EMAIL_PROVIDER: smtp | sendgrid | mock (default: mock in development, smtp in production)
    /// - APP_BASE_URL: defaults to http://localhost:8080
    /// - ORGANISATION_NAME: defaults to "CareBridge"
    fn from_env() -> Result<Self, ConfigError> {
        let default_provider = if Environment::from_env().is_production() {
            "smtp"
        } else {
            "mock"
        };
        let raw = env_or_default("EMAIL_PROVIDER", default_provider);
        let provider = raw.parse().map_err(|_| ConfigError::ParseError {
            key: "EMAIL_PROVIDER".to_string(),
            details: format!("unknown provider '{}'", raw),
        })?;

        Ok(Self {
            provider,
            base_url: env_or_default("APP_BASE_URL", "http://localhost:8080"),
            organisation_name: env_or_default("ORGANISATION_NAME", "CareBridge"),
        })
    }
}

/// Build the configured gateway, reading provider specific settings from the environment.
pub fn gateway_from_env(kind: EmailProviderKind) -> NotificationResult<Arc<dyn EmailGateway>> {
    let gateway: Arc<dyn EmailGateway> = match kind {
        EmailProviderKind::Smtp => Arc::new(SmtpGateway::new(SmtpConfig::from_env()?)?),
        EmailProviderKind::SendGrid => Arc::new(SendGridGateway::new(SendGridConfig::from_env()?)),
        EmailProviderKind::Mock => Arc::new(MockGateway::new()),
    };
    tracing::info!(provider = gateway.name(), "Email gateway configured");
    Ok(gateway)
}

pub(crate) fn provider_error(context: &str, err: impl std::fmt::Display) -> NotificationError {
    NotificationError::Provider(format!("{}: {}", context, err))
}
