//! Events whose target audience drives event-mode dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::templates::EventSummary;
use crate::vocabulary::DisabilityTag;

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
pub enum EventStatus {
    #[default]
    Draft,
    Scheduled,
    Sent,
    Cancelled,
}

impl EventStatus {
    /// Whether notifications may still be dispatched for an event in this state.
    pub fn is_dispatchable(self) -> bool {
        !matches!(self, EventStatus::Sent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub target_disabilities: BTreeSet<DisabilityTag>,
    pub status: EventStatus,
    /// Reason recorded when dispatch cancelled the event.
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn new(title: impl Into<String>, target_disabilities: BTreeSet<DisabilityTag>) -> Self {
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            description: String::new(),
            starts_at: None,
            target_disabilities,
            status: EventStatus::Draft,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn starting_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn notification_subject(&self) -> String {
        format!("Upcoming event: {}", self.title)
    }

    pub fn notification_message(&self) -> String {
        if self.description.trim().is_empty() {
            format!("We would love to see you at {}.", self.title)
        } else {
            self.description.clone()
        }
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            title: self.title.clone(),
            starts_at: self
                .starts_at
                .map(|at| at.format("%A %-d %B %Y, %H:%M UTC").to_string()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> NotificationResult<Option<Event>>;

    async fn upsert(&self, event: Event) -> NotificationResult<Event>;

    async fn set_status(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
    ) -> NotificationResult<Event>;

    /// Set `status` unless the event is currently in `unless`.
    ///
    /// Returns `None`, leaving the event untouched, when it is in `unless`.
    async fn set_status_unless(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
        unless: EventStatus,
    ) -> NotificationResult<Option<Event>>;
}

#[derive(Clone, Default)]
pub struct InMemoryEventRepository {
    events: Arc<RwLock<HashMap<Uuid, Event>>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn get(&self, id: Uuid) -> NotificationResult<Option<Event>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn upsert(&self, event: Event) -> NotificationResult<Event> {
        self.events.write().await.insert(event.id, event.clone());
        Ok(event)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
    ) -> NotificationResult<Event> {
        let mut events = self.events.write().await;
        let event = events
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found("Event", id))?;
        event.status = status;
        event.error = error;
        event.updated_at = Utc::now();
        Ok(event.clone())
    }

    async fn set_status_unless(
        &self,
        id: Uuid,
        status: EventStatus,
        error: Option<String>,
        unless: EventStatus,
    ) -> NotificationResult<Option<Event>> {
        let mut events = self.events.write().await;
        let event = events
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found("Event", id))?;
        if event.status == unless {
            return Ok(None);
        }
        event.status = status;
        event.error = error;
        event.updated_at = Utc::now();
        Ok(Some(event.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_sent_events_are_not_dispatchable() {
        assert!(EventStatus::Draft.is_dispatchable());
        assert!(EventStatus::Scheduled.is_dispatchable());
        assert!(EventStatus::Cancelled.is_dispatchable());
        assert!(!EventStatus::Sent.is_dispatchable());
    }

    #[test]
    fn test_message_falls_back_when_description_blank() {
        let event = Event::new("Sensory garden visit", BTreeSet::new());
        assert_eq!(event.notification_subject(), "Upcoming event: Sensory garden visit");
        assert!(event.notification_message().contains("Sensory garden visit"));
    }

    #[tokio::test]
    async fn test_set_status_records_error() {
        let repo = InMemoryEventRepository::new();
        let event = repo.upsert(Event::new("Picnic", BTreeSet::new())).await.unwrap();

        let updated = repo
            .set_status(event.id, EventStatus::Cancelled, Some("store down".into()))
            .await
            .unwrap();
        assert_eq!(updated.status, EventStatus::Cancelled);
        assert_eq!(updated.error.as_deref(), Some("store down"));
    }

    #[tokio::test]
    async fn test_set_status_unless_leaves_guarded_status() {
        let repo = InMemoryEventRepository::new();
        let event = repo
            .upsert(Event::new("Picnic", BTreeSet::new()).with_status(EventStatus::Sent))
            .await
            .unwrap();

        let updated = repo
            .set_status_unless(event.id, EventStatus::Cancelled, None, EventStatus::Sent)
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(repo.get(event.id).await.unwrap().unwrap().status, EventStatus::Sent);

        let draft = repo.upsert(Event::new("Fair", BTreeSet::new())).await.unwrap();
        let updated = repo
            .set_status_unless(draft.id, EventStatus::Cancelled, None, EventStatus::Sent)
            .await
            .unwrap();
        assert_eq!(updated.map(|e| e.status), Some(EventStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_set_status_unknown_event() {
        let repo = InMemoryEventRepository::new();
        let result = repo.set_status(Uuid::new_v4(), EventStatus::Sent, None).await;
        assert!(matches!(result, Err(NotificationError::NotFound { .. })));
    }
}
