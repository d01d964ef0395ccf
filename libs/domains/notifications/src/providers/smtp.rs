//! SMTP gateway using lettre.
//!
//! Works against a real relay with TLS or a local catcher such as Mailpit.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{
        Mailbox, MultiPart, SinglePart,
        header::{ContentType, HeaderName, HeaderValue},
    },
    transport::smtp::authentication::Credentials,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::{EmailGateway, GatewayReceipt, OutboundEmail, provider_error};
use crate::error::NotificationResult;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Disable for local dev servers.
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(host: String, port: u16, from_email: String, from_name: String) -> Self {
        Self {
            host,
            port,
            from_email,
            from_name,
            username: None,
            password: None,
            use_tls: false,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

impl FromEnv for SmtpConfig {
    /// Defaults target a local Mailpit on port 1025.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 1025)?,
            from_email: env_or_default("SMTP_FROM_EMAIL", "noreply@localhost"),
            from_name: env_or_default("SMTP_FROM_NAME", "CareBridge"),
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            use_tls: env_parse("SMTP_TLS", false)?,
        })
    }
}

pub struct SmtpGateway {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: Arc<SmtpConfig>,
}

impl SmtpGateway {
    pub fn new(config: SmtpConfig) -> NotificationResult<Self> {
        let transport = Self::build_transport(&config)?;
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| provider_error("Failed to create SMTP relay", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn build_message(&self, email: &OutboundEmail) -> NotificationResult<Message> {
        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| provider_error("Invalid from address", e))?;

        let to: Mailbox = if email.to_name.is_empty() {
            email.to.parse()
        } else {
            format!("{} <{}>", email.to_name, email.to).parse()
        }
        .map_err(|e| provider_error("Invalid recipient address", e))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("X-Correlation-ID"),
                email.correlation_id.clone(),
            ))
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html.clone()),
                    ),
            )
            .map_err(|e| provider_error("Failed to build email message", e))
    }
}

#[async_trait]
impl EmailGateway for SmtpGateway {
    async fn send(&self, email: &OutboundEmail) -> NotificationResult<GatewayReceipt> {
        debug!(
            to = %email.to,
            correlation_id = %email.correlation_id,
            host = %self.config.host,
            "Sending email via SMTP"
        );

        let message = self.build_message(email)?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| provider_error("SMTP send failed", e))?;

        let gateway_message_id = response.message().next().map(|s| s.to_string());
        info!(to = %email.to, message_id = ?gateway_message_id, "Email accepted by SMTP relay");

        Ok(GatewayReceipt { gateway_message_id })
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| provider_error("SMTP health check failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> SmtpGateway {
        SmtpGateway::new(SmtpConfig::new(
            "localhost".into(),
            1025,
            "office@example.org".into(),
            "Family Support".into(),
        ))
        .unwrap()
    }

    #[test]
    fn test_smtp_config_from_env_defaults() {
        temp_env::with_vars(
            [
                ("SMTP_HOST", None::<&str>),
                ("SMTP_PORT", None),
                ("SMTP_TLS", None),
            ],
            || {
                let config = SmtpConfig::from_env().unwrap();
                assert_eq!(config.host, "localhost");
                assert_eq!(config.port, 1025);
                assert!(!config.use_tls);
            },
        );
    }

    #[test]
    fn test_smtp_config_rejects_bad_port() {
        temp_env::with_var("SMTP_PORT", Some("smtp"), || {
            assert!(SmtpConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_with_credentials_and_tls() {
        let config = SmtpConfig::new("smtp.example.org".into(), 587, "a@b.c".into(), "A".into())
            .with_tls(true)
            .with_credentials("user".into(), "pass".into());
        assert!(config.use_tls);
        assert_eq!(config.username.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_build_message_rejects_invalid_recipient() {
        let email = OutboundEmail {
            to: "not an address".into(),
            subject: "Hi".into(),
            ..Default::default()
        };
        assert!(gateway().build_message(&email).is_err());
    }

    #[tokio::test]
    async fn test_build_message_carries_correlation_header() {
        let email = OutboundEmail {
            to: "parent@example.com".into(),
            to_name: "Pat Parent".into(),
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
            text: "Hi".into(),
            correlation_id: "abc-123".into(),
        };
        let message = gateway().build_message(&email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("X-Correlation-ID: abc-123"));
    }
}
