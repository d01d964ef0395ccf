use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::{DEFAULT_CACHE_TTL, RecipientCache};
use crate::config::DispatchConfig;
use crate::dispatcher::{
    BatchDispatcher, CancellationHandle, CancellationSignal, DispatchRequest, cancellation_pair,
};
use crate::error::{NotificationError, NotificationResult};
use crate::events::{Event, EventRepository, EventStatus, InMemoryEventRepository};
use crate::models::{
    BroadcastResult, DeliverySignal, DispatchOutcome, DispatchStats, EventDispatchResult,
    NewNotification, Notification, NotificationMetadata, NotificationStatus, SendToParentsRequest,
    StatusChange,
};
use crate::providers::EmailGateway;
use crate::rate_limiter::RateLimiter;
use crate::recipients::{ChildRecordRepository, InMemoryChildRecordRepository, RecipientMatcher};
use crate::repository::{InMemoryNotificationRepository, NotificationRepository};
use crate::suppression::{InMemorySuppressionRepository, SuppressionReason, SuppressionRepository};
use crate::templates::MessageRenderer;
use crate::vocabulary::{DisabilityTag, display_names, parse_tag_set};

/// Persistence collaborators of the service.
#[derive(Clone)]
pub struct NotificationStores {
    pub notifications: Arc<dyn NotificationRepository>,
    pub events: Arc<dyn EventRepository>,
    pub children: Arc<dyn ChildRecordRepository>,
    pub suppressions: Arc<dyn SuppressionRepository>,
}

impl NotificationStores {
    pub fn in_memory() -> Self {
        Self {
            notifications: Arc::new(InMemoryNotificationRepository::new()),
            events: Arc::new(InMemoryEventRepository::new()),
            children: Arc::new(InMemoryChildRecordRepository::new()),
            suppressions: Arc::new(InMemorySuppressionRepository::new()),
        }
    }
}

type Registry = Arc<Mutex<HashMap<Uuid, CancellationHandle>>>;

/// Registration of an in-flight dispatch, removed on drop.
struct RunningDispatch {
    registry: Registry,
    event_id: Uuid,
}

impl Drop for RunningDispatch {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.event_id);
    }
}

/// Entry point for every notification operation.
#[derive(Clone)]
pub struct NotificationService {
    matcher: RecipientMatcher,
    store: Arc<dyn NotificationRepository>,
    events: Arc<dyn EventRepository>,
    suppressions: Arc<dyn SuppressionRepository>,
    dispatcher: BatchDispatcher,
    config: DispatchConfig,
    running: Registry,
}

impl NotificationService {
    pub fn new(
        stores: NotificationStores,
        gateway: Arc<dyn EmailGateway>,
        renderer: MessageRenderer,
        config: DispatchConfig,
    ) -> Self {
        let ttl = chrono::Duration::from_std(config.cache_ttl).unwrap_or(DEFAULT_CACHE_TTL);
        let dispatcher = BatchDispatcher::new(
            stores.notifications.clone(),
            stores.events.clone(),
            gateway,
            stores.children.clone(),
            renderer,
        )
        .with_rate_limiter(Arc::new(RateLimiter::new(
            config.rate_limit,
            config.rate_window,
        )))
        .with_cache(Arc::new(RecipientCache::with_system_clock(ttl)))
        .with_timeouts(config.send_timeout, config.rate_wait);

        Self {
            matcher: RecipientMatcher::new(stores.children, stores.suppressions.clone())
                .with_policy(config.name_policy),
            store: stores.notifications,
            events: stores.events,
            suppressions: stores.suppressions,
            dispatcher,
            config,
            running: Arc::default(),
        }
    }

    /// Replace the dispatcher, e.g. to share a limiter or inject a test clock.
    pub fn with_dispatcher(mut self, dispatcher: BatchDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Distinct guardians a send to `tags` would reach.
    #[instrument(skip(self))]
    pub async fn recipient_count(&self, tags: &BTreeSet<DisabilityTag>) -> NotificationResult<usize> {
        self.matcher.count_by_disabilities(tags).await
    }

    /// Send one message to every guardian matching the request's tags.
    #[instrument(skip(self, request), fields(subject = %request.subject))]
    pub async fn send_broadcast(
        &self,
        request: SendToParentsRequest,
    ) -> NotificationResult<DispatchOutcome<BroadcastResult>> {
        request.validate()?;
        let tags = parse_tag_set(&request.disability_types)?;

        let recipients = self.matcher.match_by_disabilities(&tags).await?;
        if recipients.is_empty() {
            info!("Broadcast matched no recipients");
            return Ok(DispatchOutcome::NoRecipients);
        }

        self.dispatcher.prime_cache(&recipients, &tags).await;

        let group_description = if tags.is_empty() {
            "All families".to_string()
        } else {
            display_names(&tags).join(", ")
        };

        let notification = self
            .store
            .create_many(vec![NewNotification::batch(
                request.sender_id,
                recipients,
                group_description,
                request.subject.trim(),
                request.message.trim(),
            )])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| NotificationError::Database("batch insert returned no rows".into()))?;

        info!(
            notification_id = %notification.id,
            recipients = notification.metadata.recipients.len(),
            "Broadcast created"
        );

        let result = self
            .dispatcher
            .dispatch_batch(
                &notification,
                self.config.batch_size,
                self.config.concurrency,
                &CancellationSignal::never(),
            )
            .await?;

        Ok(DispatchOutcome::Completed(result))
    }

    /// Create one notification per matched guardian of an event and send them.
    ///
    /// The dispatch is registered before the event is read, so a dispatch that
    /// finished in the meantime is seen as `sent`, and a cancel issued at any
    /// point after registration reaches this dispatch.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn notify_event(
        &self,
        event_id: Uuid,
        sender_id: Option<Uuid>,
    ) -> NotificationResult<DispatchOutcome<EventDispatchResult>> {
        let (handle, signal) = cancellation_pair();
        let running = self.register(event_id, handle)?;

        let event = self.load_event(event_id).await?;
        if !event.status.is_dispatchable() {
            warn!(status = %event.status, "Event already sent, refusing dispatch");
            return Err(NotificationError::AlreadySent(event_id));
        }

        let recipients = match self
            .matcher
            .match_by_disabilities(&event.target_disabilities)
            .await
        {
            Ok(recipients) => recipients,
            Err(err) => return Err(self.fail_event(event_id, err).await),
        };
        if recipients.is_empty() {
            info!("Event matched no recipients");
            return Ok(DispatchOutcome::NoRecipients);
        }
        if signal.is_cancelled() {
            info!("Event cancelled before notifications were created");
            return Ok(DispatchOutcome::Completed(EventDispatchResult {
                event_id,
                notification_ids: Vec::new(),
                stats: DispatchStats::default(),
            }));
        }

        let subject = event.notification_subject();
        let message = event.notification_message();
        let batch = recipients
            .iter()
            .map(|contact| {
                NewNotification::for_recipient(Some(event_id), sender_id, contact, &subject, &message)
            })
            .collect();

        let notifications = match self.store.create_many(batch).await {
            Ok(created) => created,
            Err(err) => return Err(self.fail_event(event_id, err).await),
        };
        let notification_ids = notifications.iter().map(|n| n.id).collect();

        info!(
            notifications = notifications.len(),
            "Event notifications created"
        );

        let stats = self
            .spawn_dispatch(
                DispatchRequest {
                    notifications,
                    recipients,
                    batch_size: self.config.batch_size,
                    concurrency: self.config.concurrency,
                    event: Some(event),
                },
                signal,
                running,
            )
            .await?;

        Ok(DispatchOutcome::Completed(EventDispatchResult {
            event_id,
            notification_ids,
            stats,
        }))
    }

    /// Re-send failed notifications of an event as fresh notifications.
    ///
    /// Skips recipients that were suppressed since, notifications that already
    /// have a retry, and those at `max_retries` failed attempts.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn retry_failed(
        &self,
        event_id: Uuid,
        max_retries: Option<u32>,
    ) -> NotificationResult<DispatchStats> {
        let (handle, signal) = cancellation_pair();
        let running = self.register(event_id, handle)?;

        self.load_event(event_id).await?;
        let max_retries = max_retries.unwrap_or(self.config.max_retries);

        let all = self.store.list_by_event(event_id).await?;
        let already_retried: HashSet<Uuid> =
            all.iter().filter_map(|n| n.metadata.retry_of).collect();

        let candidates: Vec<Notification> = all
            .into_iter()
            .filter(|n| n.status == NotificationStatus::Failed)
            .filter(|n| !already_retried.contains(&n.id))
            .filter(|n| n.metadata.retry_count < max_retries)
            .filter(|n| n.recipient_id.is_some())
            .collect();

        let emails: Vec<String> = candidates
            .iter()
            .filter_map(|n| n.recipient_id.clone())
            .collect();
        let suppressed = self.suppressions.suppressed_among(&emails).await?;

        let retries: Vec<NewNotification> = candidates
            .into_iter()
            .filter(|n| {
                n.recipient_email()
                    .is_some_and(|email| !suppressed.contains(email))
            })
            .map(|failed| NewNotification {
                event_id: failed.event_id,
                sender_id: failed.sender_id,
                recipient_id: failed.recipient_id,
                subject: failed.subject,
                message: failed.message,
                kind: failed.kind,
                is_batch: false,
                metadata: NotificationMetadata {
                    retry_count: failed.metadata.retry_count,
                    retry_of: Some(failed.id),
                    recipient_name: failed.metadata.recipient_name,
                    ..Default::default()
                },
            })
            .collect();

        if retries.is_empty() {
            info!("No failed notifications eligible for retry");
            return Ok(DispatchStats::default());
        }

        let notifications = self.store.create_many(retries).await?;
        info!(retries = notifications.len(), "Retrying failed notifications");

        self.spawn_dispatch(
            DispatchRequest {
                notifications,
                recipients: Vec::new(),
                batch_size: self.config.batch_size,
                concurrency: self.config.concurrency,
                event: None,
            },
            signal,
            running,
        )
        .await
    }

    /// Mark an event cancelled and stop its in-flight dispatch, if any.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn cancel_event(&self, event_id: Uuid) -> NotificationResult<Event> {
        // Signal first: a dispatch that has not yet settled will then leave the
        // event alone, and one that already marked it sent wins below.
        let stopped = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .map(CancellationHandle::cancel)
            .is_some();

        let event = self
            .events
            .set_status_unless(event_id, EventStatus::Cancelled, None, EventStatus::Sent)
            .await?
            .ok_or(NotificationError::AlreadySent(event_id))?;

        info!(stopped_dispatch = stopped, "Event cancelled");
        Ok(event)
    }

    /// Consume an unsubscribe token. Unknown and reused tokens succeed silently.
    #[instrument(skip_all)]
    pub async fn unsubscribe(&self, token: &str) -> NotificationResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(());
        }

        let Some(notification) = self.store.find_by_unsubscribe_token(token).await? else {
            debug!("Unsubscribe token not recognised");
            return Ok(());
        };

        if !self
            .store
            .mark_unsubscribed(notification.id, Utc::now())
            .await?
        {
            debug!(notification_id = %notification.id, "Unsubscribe token already used");
            return Ok(());
        }

        if let Some(email) = notification.recipient_email() {
            self.suppressions
                .suppress(email, SuppressionReason::Unsubscribe)
                .await?;
            self.dispatcher.cache().invalidate(email).await;
        }

        info!(
            notification_id = %notification.id,
            is_batch = notification.is_batch,
            "Recipient unsubscribed"
        );
        Ok(())
    }

    /// Apply gateway feedback to a sent notification.
    #[instrument(skip(self, signal))]
    pub async fn apply_delivery_signal(
        &self,
        notification_id: Option<Uuid>,
        gateway_message_id: Option<&str>,
        signal: DeliverySignal,
    ) -> NotificationResult<Notification> {
        let notification = match (notification_id, gateway_message_id) {
            (Some(id), _) => self.store.get(id).await?,
            (None, Some(message_id)) => self.store.find_by_gateway_message_id(message_id).await?,
            (None, None) => {
                return Err(NotificationError::Validation(
                    "notificationId or gatewayMessageId is required".to_string(),
                ));
            }
        }
        .ok_or_else(|| {
            NotificationError::not_found(
                "Notification",
                notification_id
                    .map(|id| id.to_string())
                    .or(gateway_message_id.map(str::to_string))
                    .unwrap_or_default(),
            )
        })?;

        let updated = match signal {
            DeliverySignal::Delivered => {
                self.store
                    .transition(notification.id, StatusChange::to(NotificationStatus::Delivered))
                    .await?
            }
            DeliverySignal::Opened => {
                // An open implies delivery; gateways may report it first.
                if notification.status == NotificationStatus::Sent {
                    self.store
                        .transition(notification.id, StatusChange::to(NotificationStatus::Delivered))
                        .await?;
                }
                self.store
                    .transition(notification.id, StatusChange::to(NotificationStatus::Opened))
                    .await?
            }
            DeliverySignal::Bounced { reason } => {
                let updated = self
                    .store
                    .transition(
                        notification.id,
                        StatusChange::to(NotificationStatus::Bounced)
                            .with_error(reason.unwrap_or_else(|| "bounced".to_string())),
                    )
                    .await?;
                if let Some(email) = updated.recipient_email() {
                    self.suppressions
                        .suppress(email, SuppressionReason::Bounce)
                        .await?;
                }
                updated
            }
        };

        info!(
            notification_id = %updated.id,
            status = %updated.status,
            "Delivery signal applied"
        );
        Ok(updated)
    }

    #[instrument(skip(self), fields(notification_id = %id))]
    pub async fn get_notification(&self, id: Uuid) -> NotificationResult<Notification> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::not_found("Notification", id))
    }

    #[instrument(skip(self), fields(notification_id = %id))]
    pub async fn delete_notification(&self, id: Uuid) -> NotificationResult<()> {
        if !self.store.delete(id).await? {
            return Err(NotificationError::not_found("Notification", id));
        }
        Ok(())
    }

    async fn load_event(&self, event_id: Uuid) -> NotificationResult<Event> {
        self.events
            .get(event_id)
            .await?
            .ok_or_else(|| NotificationError::not_found("Event", event_id))
    }

    fn register(
        &self,
        event_id: Uuid,
        handle: CancellationHandle,
    ) -> NotificationResult<RunningDispatch> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(&event_id) {
            return Err(NotificationError::Validation(format!(
                "a dispatch for event {} is already in progress",
                event_id
            )));
        }
        running.insert(event_id, handle);
        Ok(RunningDispatch {
            registry: self.running.clone(),
            event_id,
        })
    }

    /// Run the dispatch on its own task so an abandoned request cannot abort it.
    async fn spawn_dispatch(
        &self,
        request: DispatchRequest,
        signal: CancellationSignal,
        running: RunningDispatch,
    ) -> NotificationResult<DispatchStats> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let _running = running;
            dispatcher.dispatch(request, &signal).await
        })
        .await
        .map_err(|e| NotificationError::Pipeline(format!("dispatch task failed: {}", e)))?
    }

    async fn fail_event(&self, event_id: Uuid, err: NotificationError) -> NotificationError {
        error!(error = %err, "Event dispatch failed before sending, cancelling event");
        if let Err(status_err) = self
            .events
            .set_status(event_id, EventStatus::Cancelled, Some(err.to_string()))
            .await
        {
            error!(error = %status_err, "Failed to cancel event");
        }
        err
    }
}
