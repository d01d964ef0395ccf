//! Data models for notification dispatch.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{NotificationError, NotificationResult};
use crate::vocabulary::DisabilityTag;

/// Length of generated unsubscribe tokens.
pub const UNSUBSCRIBE_TOKEN_LENGTH: usize = 64;

/// Generate a random alphanumeric unsubscribe token.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(UNSUBSCRIBE_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Lifecycle state of a notification.
///
/// ```text
/// pending ──► sending ──► sent ──► delivered ──► opened
///    │           │          │          │
///    │           ├─► partial (broadcast only)
///    └───────────┴──────────┴──────────┴──► failed | bounced
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Opened,
    Failed,
    Bounced,
    Partial,
}

impl NotificationStatus {
    /// States reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [NotificationStatus] {
        use NotificationStatus::*;
        match self {
            Pending => &[Sending, Failed, Bounced],
            Sending => &[Sent, Partial, Failed, Bounced],
            Sent => &[Delivered, Failed, Bounced],
            Delivered => &[Opened, Failed, Bounced],
            Opened | Failed | Bounced | Partial => &[],
        }
    }

    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn ensure_transition(self, next: NotificationStatus) -> NotificationResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(NotificationError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Delivery channel. Only email is dispatched.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    #[default]
    Email,
    Sms,
    Push,
}

/// A deduplicated guardian contact derived from one or more child records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecipientContact {
    /// Trimmed, lowercased guardian email.
    pub email: String,
    pub display_name: String,
    pub disability_tags: BTreeSet<DisabilityTag>,
}

/// Aggregate counts recorded on a batch notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryCounts {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Free-form delivery bookkeeping persisted alongside a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    /// Number of send attempts that ended in failure.
    #[serde(default)]
    pub retry_count: u32,

    /// The failed notification this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,

    /// Fan-out list for batch notifications.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<RecipientContact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DeliveryCounts>,
}

/// The unit of delivery tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub sender_id: Option<Uuid>,
    /// Normalised guardian email; `None` for batch notifications.
    pub recipient_id: Option<String>,
    pub subject: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub status: NotificationStatus,
    pub is_batch: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub gateway_message_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub unsubscribe_token: String,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub metadata: NotificationMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Apply a lifecycle change, rejecting transitions outside the state machine.
    pub fn apply(&mut self, change: &StatusChange) -> NotificationResult<()> {
        self.status.ensure_transition(change.to)?;

        match change.to {
            NotificationStatus::Sent | NotificationStatus::Partial => {
                self.sent_at = Some(change.at);
            }
            NotificationStatus::Delivered => self.delivered_at = Some(change.at),
            NotificationStatus::Opened => self.opened_at = Some(change.at),
            _ => {}
        }

        if let Some(message_id) = &change.gateway_message_id {
            self.gateway_message_id = Some(message_id.clone());
        }
        if let Some(error) = &change.error {
            self.error = Some(error.clone());
        }
        if change.count_attempt {
            self.metadata.retry_count += 1;
        }

        self.status = change.to;
        self.updated_at = change.at;
        Ok(())
    }

    /// Address for event-mode notifications.
    pub fn recipient_email(&self) -> Option<&str> {
        self.recipient_id.as_deref()
    }
}

/// Input for creating a notification; identity and token are assigned on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub event_id: Option<Uuid>,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<String>,
    pub subject: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_batch: bool,
    pub metadata: NotificationMetadata,
}

impl NewNotification {
    /// One notification per guardian, used by event dispatch.
    pub fn for_recipient(
        event_id: Option<Uuid>,
        sender_id: Option<Uuid>,
        recipient: &RecipientContact,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            sender_id,
            recipient_id: Some(recipient.email.clone()),
            subject: subject.into(),
            message: message.into(),
            kind: NotificationKind::Email,
            is_batch: false,
            metadata: NotificationMetadata {
                recipient_name: Some(recipient.display_name.clone()),
                ..Default::default()
            },
        }
    }

    /// A single record fanning out to every matched guardian.
    pub fn batch(
        sender_id: Option<Uuid>,
        recipients: Vec<RecipientContact>,
        group_description: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            sender_id,
            recipient_id: None,
            subject: subject.into(),
            message: message.into(),
            kind: NotificationKind::Email,
            is_batch: true,
            metadata: NotificationMetadata {
                recipients,
                group_description: Some(group_description.into()),
                ..Default::default()
            },
        }
    }

    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::now_v7(),
            event_id: self.event_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            subject: self.subject,
            message: self.message,
            kind: self.kind,
            status: NotificationStatus::Pending,
            is_batch: self.is_batch,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            error: None,
            gateway_message_id: None,
            unsubscribe_token: generate_token(),
            unsubscribed_at: None,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A requested lifecycle change plus the delivery metadata it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: NotificationStatus,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
    pub gateway_message_id: Option<String>,
    /// Increment `metadata.retry_count`.
    pub count_attempt: bool,
}

impl StatusChange {
    pub fn to(status: NotificationStatus) -> Self {
        Self {
            to: status,
            at: Utc::now(),
            error: None,
            gateway_message_id: None,
            count_attempt: false,
        }
    }

    pub fn sent(gateway_message_id: Option<String>) -> Self {
        Self {
            gateway_message_id,
            ..Self::to(NotificationStatus::Sent)
        }
    }

    /// A failed send attempt.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            count_attempt: true,
            ..Self::to(NotificationStatus::Failed)
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn without_attempt(mut self) -> Self {
        self.count_attempt = false;
        self
    }
}

/// Per-recipient failure reported in dispatch statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFailure {
    pub recipient_id: String,
    pub error: String,
}

/// Aggregate outcome of a dispatch. `success + failed == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DispatchStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<RecipientFailure>,
}

impl DispatchStats {
    pub fn record_success(&mut self) {
        self.total += 1;
        self.success += 1;
    }

    pub fn record_failure(&mut self, recipient_id: impl Into<String>, error: impl Into<String>) {
        self.total += 1;
        self.failed += 1;
        self.errors.push(RecipientFailure {
            recipient_id: recipient_id.into(),
            error: error.into(),
        });
    }

    pub fn counts(&self) -> DeliveryCounts {
        DeliveryCounts {
            total: self.total,
            success: self.success,
            failed: self.failed,
        }
    }
}

/// Result of a broadcast send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub stats: DispatchStats,
}

/// Result of an event dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventDispatchResult {
    pub event_id: Uuid,
    pub notification_ids: Vec<Uuid>,
    pub stats: DispatchStats,
}

/// Dispatch outcome distinguishing "nobody matched" from a completed send.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome<T> {
    Completed(T),
    NoRecipients,
}

impl<T> DispatchOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            DispatchOutcome::Completed(value) => Some(value),
            DispatchOutcome::NoRecipients => None,
        }
    }
}

/// Out-of-band delivery feedback, typically from a gateway webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverySignal {
    Delivered,
    Opened,
    Bounced { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySignalKind {
    Delivered,
    Opened,
    Bounced,
}

/// Webhook payload. One of `notification_id` or `gateway_message_id` identifies the target.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySignalRequest {
    pub notification_id: Option<Uuid>,
    pub gateway_message_id: Option<String>,
    pub signal: DeliverySignalKind,
    /// Bounce reason.
    pub reason: Option<String>,
}

impl DeliverySignalRequest {
    pub fn signal(&self) -> DeliverySignal {
        match self.signal {
            DeliverySignalKind::Delivered => DeliverySignal::Delivered,
            DeliverySignalKind::Opened => DeliverySignal::Opened,
            DeliverySignalKind::Bounced => DeliverySignal::Bounced {
                reason: self.reason.clone(),
            },
        }
    }
}

/// Broadcast request body.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendToParentsRequest {
    #[validate(length(min = 1, max = 200), custom(function = "not_blank"))]
    pub subject: String,

    #[validate(length(min = 1, max = 20000), custom(function = "not_blank"))]
    pub message: String,

    /// Disability tags; empty targets every guardian.
    #[serde(default)]
    pub disability_types: Vec<String>,

    pub sender_id: Option<Uuid>,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}
