//! SendGrid v3 mail send gateway.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_required};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{EmailGateway, GatewayReceipt, OutboundEmail};
use crate::error::{NotificationError, NotificationResult};

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    /// Defaults to production.
    pub api_url: String,
}

impl SendGridConfig {
    pub fn new(api_key: String, from_email: String, from_name: String) -> Self {
        Self {
            api_key,
            from_email,
            from_name,
            api_url: "https://api.sendgrid.com/v3".to_string(),
        }
    }
}

impl FromEnv for SendGridConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            env_required("SENDGRID_API_KEY")?,
            env_required("SENDGRID_FROM_EMAIL")?,
            env_or_default("SENDGRID_FROM_NAME", "CareBridge"),
        );
        if let Ok(url) = std::env::var("SENDGRID_API_URL") {
            config.api_url = url;
        }
        Ok(config)
    }
}

pub struct SendGridGateway {
    config: SendGridConfig,
    client: Client,
}

impl SendGridGateway {
    pub fn new(config: SendGridConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_request(&self, email: &OutboundEmail) -> SendGridRequest {
        SendGridRequest {
            personalizations: vec![Personalization {
                to: vec![EmailAddress {
                    email: email.to.clone(),
                    name: (!email.to_name.is_empty()).then(|| email.to_name.clone()),
                }],
                custom_args: HashMap::from([(
                    "correlation_id".to_string(),
                    email.correlation_id.clone(),
                )]),
            }],
            from: EmailAddress {
                email: self.config.from_email.clone(),
                name: Some(self.config.from_name.clone()),
            },
            subject: email.subject.clone(),
            content: vec![
                Content {
                    content_type: "text/plain".to_string(),
                    value: email.text.clone(),
                },
                Content {
                    content_type: "text/html".to_string(),
                    value: email.html.clone(),
                },
            ],
        }
    }
}

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<Personalization>,
    from: EmailAddress,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<EmailAddress>,
    custom_args: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

#[async_trait]
impl EmailGateway for SendGridGateway {
    async fn send(&self, email: &OutboundEmail) -> NotificationResult<GatewayReceipt> {
        debug!(to = %email.to, correlation_id = %email.correlation_id, "Sending email via SendGrid");

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&self.build_request(email))
            .send()
            .await?;

        let status = response.status();
        let gateway_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(to = %email.to, message_id = ?gateway_message_id, "Email accepted by SendGrid");
            return Ok(GatewayReceipt { gateway_message_id });
        }

        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<SendGridError>(&body) {
            Ok(parsed) => parsed
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join(", "),
            Err(_) => body,
        };
        warn!(to = %email.to, status = %status, error = %detail, "SendGrid rejected email");

        Err(NotificationError::RecipientSend {
            recipient: email.to.clone(),
            reason: format!("SendGrid error ({}): {}", status, detail),
        })
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        // No health endpoint; validate the key shape instead.
        if self.config.api_key.starts_with("SG.") {
            Ok(true)
        } else {
            Err(NotificationError::Config(
                "Invalid SendGrid API key format".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(key: &str) -> SendGridGateway {
        SendGridGateway::new(SendGridConfig::new(
            key.into(),
            "office@example.org".into(),
            "Family Support".into(),
        ))
    }

    #[test]
    fn test_request_carries_correlation_id_and_both_bodies() {
        let email = OutboundEmail {
            to: "parent@example.com".into(),
            to_name: String::new(),
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
            text: "Hi".into(),
            correlation_id: "n-1".into(),
        };
        let json = serde_json::to_value(gateway("SG.x").build_request(&email)).unwrap();

        assert_eq!(json["personalizations"][0]["custom_args"]["correlation_id"], "n-1");
        assert!(json["personalizations"][0]["to"][0].get("name").is_none());
        assert_eq!(json["content"][0]["type"], "text/plain");
        assert_eq!(json["content"][1]["type"], "text/html");
    }

    #[test]
    fn test_config_requires_api_key() {
        temp_env::with_vars(
            [
                ("SENDGRID_API_KEY", None::<&str>),
                ("SENDGRID_FROM_EMAIL", Some("a@b.c")),
            ],
            || {
                let err = SendGridConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("SENDGRID_API_KEY"));
            },
        );
    }

    #[tokio::test]
    async fn test_health_check_validates_key_format() {
        assert!(gateway("SG.abc").health_check().await.unwrap());
        assert!(gateway("abc").health_check().await.is_err());
    }
}
