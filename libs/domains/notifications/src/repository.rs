use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    NewNotification, Notification, NotificationMetadata, NotificationStatus, StatusChange,
};

/// Repository trait for notification persistence
///
/// Status changes go through [`NotificationRepository::transition`], which
/// enforces the lifecycle state machine at the store boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a batch of notifications. Either every row is created or none is.
    async fn create_many(&self, batch: Vec<NewNotification>) -> NotificationResult<Vec<Notification>>;

    async fn get(&self, id: Uuid) -> NotificationResult<Option<Notification>>;

    async fn find_by_unsubscribe_token(&self, token: &str) -> NotificationResult<Option<Notification>>;

    async fn find_by_gateway_message_id(
        &self,
        gateway_message_id: &str,
    ) -> NotificationResult<Option<Notification>>;

    /// Apply a status change, rejecting transitions the state machine forbids.
    async fn transition(&self, id: Uuid, change: StatusChange) -> NotificationResult<Notification>;

    async fn update_metadata(
        &self,
        id: Uuid,
        metadata: NotificationMetadata,
    ) -> NotificationResult<Notification>;

    /// Record an unsubscribe. Returns `false` when the notification was already unsubscribed.
    async fn mark_unsubscribed(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<bool>;

    /// Notifications of one event, oldest first.
    async fn list_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>>;

    /// Failed notifications of one event, oldest first.
    async fn list_failed_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>>;

    async fn delete(&self, id: Uuid) -> NotificationResult<bool>;
}

/// In-memory implementation of NotificationRepository (for testing/development)
#[derive(Clone, Default)]
pub struct InMemoryNotificationRepository {
    notifications: Arc<RwLock<HashMap<Uuid, Notification>>>,
    fail_creates: Arc<AtomicBool>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_many` calls fail, simulating a store outage.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.notifications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.notifications.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Notification> {
        let mut all: Vec<_> = self.notifications.read().await.values().cloned().collect();
        all.sort_by_key(|n| n.id);
        all
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create_many(&self, batch: Vec<NewNotification>) -> NotificationResult<Vec<Notification>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(NotificationError::Database(
                "simulated failure creating notifications".to_string(),
            ));
        }

        let now = Utc::now();
        let created: Vec<Notification> = batch
            .into_iter()
            .map(|new| new.into_notification(now))
            .collect();

        let mut notifications = self.notifications.write().await;

        let mut tokens: HashSet<&str> = notifications
            .values()
            .map(|n| n.unsubscribe_token.as_str())
            .collect();
        for notification in &created {
            if !tokens.insert(notification.unsubscribe_token.as_str()) {
                return Err(NotificationError::Database(
                    "duplicate unsubscribe token".to_string(),
                ));
            }
        }

        for notification in &created {
            notifications.insert(notification.id, notification.clone());
        }

        Ok(created)
    }

    async fn get(&self, id: Uuid) -> NotificationResult<Option<Notification>> {
        Ok(self.notifications.read().await.get(&id).cloned())
    }

    async fn find_by_unsubscribe_token(&self, token: &str) -> NotificationResult<Option<Notification>> {
        Ok(self
            .notifications
            .read()
            .await
            .values()
            .find(|n| n.unsubscribe_token == token)
            .cloned())
    }

    async fn find_by_gateway_message_id(
        &self,
        gateway_message_id: &str,
    ) -> NotificationResult<Option<Notification>> {
        Ok(self
            .notifications
            .read()
            .await
            .values()
            .find(|n| n.gateway_message_id.as_deref() == Some(gateway_message_id))
            .cloned())
    }

    async fn transition(&self, id: Uuid, change: StatusChange) -> NotificationResult<Notification> {
        let mut notifications = self.notifications.write().await;
        let notification = notifications
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found("Notification", id))?;

        let mut updated = notification.clone();
        updated.apply(&change)?;
        *notification = updated.clone();
        Ok(updated)
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        metadata: NotificationMetadata,
    ) -> NotificationResult<Notification> {
        let mut notifications = self.notifications.write().await;
        let notification = notifications
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found("Notification", id))?;

        notification.metadata = metadata;
        notification.updated_at = Utc::now();
        Ok(notification.clone())
    }

    async fn mark_unsubscribed(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<bool> {
        let mut notifications = self.notifications.write().await;
        let notification = notifications
            .get_mut(&id)
            .ok_or_else(|| NotificationError::not_found("Notification", id))?;

        if notification.unsubscribed_at.is_some() {
            return Ok(false);
        }
        notification.unsubscribed_at = Some(at);
        notification.updated_at = at;
        Ok(true)
    }

    async fn list_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>> {
        let mut list: Vec<_> = self
            .notifications
            .read()
            .await
            .values()
            .filter(|n| n.event_id == Some(event_id))
            .cloned()
            .collect();
        list.sort_by_key(|n| n.id);
        Ok(list)
    }

    async fn list_failed_by_event(&self, event_id: Uuid) -> NotificationResult<Vec<Notification>> {
        Ok(self
            .list_by_event(event_id)
            .await?
            .into_iter()
            .filter(|n| n.status == NotificationStatus::Failed)
            .collect())
    }

    async fn delete(&self, id: Uuid) -> NotificationResult<bool> {
        Ok(self.notifications.write().await.remove(&id).is_some())
    }
}
