//! Suppression list of guardian addresses that must not be emailed again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::error::NotificationResult;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SuppressionReason {
    Unsubscribe,
    Bounce,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailSuppression {
    pub email: String,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SuppressionRepository: Send + Sync {
    /// Add an address. Suppressing an already suppressed address keeps the original entry.
    async fn suppress(&self, email: &str, reason: SuppressionReason) -> NotificationResult<()>;

    async fn is_suppressed(&self, email: &str) -> NotificationResult<bool>;

    /// The subset of `emails` that is suppressed.
    async fn suppressed_among(&self, emails: &[String]) -> NotificationResult<HashSet<String>>;

    async fn list(&self) -> NotificationResult<Vec<EmailSuppression>>;
}

/// Normalised form used for every suppression lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Clone, Default)]
pub struct InMemorySuppressionRepository {
    entries: Arc<RwLock<HashMap<String, EmailSuppression>>>,
}

impl InMemorySuppressionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuppressionRepository for InMemorySuppressionRepository {
    async fn suppress(&self, email: &str, reason: SuppressionReason) -> NotificationResult<()> {
        let email = normalize_email(email);
        self.entries
            .write()
            .await
            .entry(email.clone())
            .or_insert_with(|| EmailSuppression {
                email,
                reason,
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn is_suppressed(&self, email: &str) -> NotificationResult<bool> {
        Ok(self.entries.read().await.contains_key(&normalize_email(email)))
    }

    async fn suppressed_among(&self, emails: &[String]) -> NotificationResult<HashSet<String>> {
        let entries = self.entries.read().await;
        Ok(emails
            .iter()
            .map(|email| normalize_email(email))
            .filter(|email| entries.contains_key(email))
            .collect())
    }

    async fn list(&self) -> NotificationResult<Vec<EmailSuppression>> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}
