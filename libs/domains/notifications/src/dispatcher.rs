//! Bounded-concurrency fan-out of per-recipient sends.
//!
//! ```text
//! notifications ──► chunks of batch_size ──► Semaphore(concurrency) ──► JoinSet
//!                                                      │
//!                         RateLimiter token ◄──────────┤
//!                         render (cache-backed) ◄──────┤
//!                         EmailGateway (timeout) ◄─────┘
//!                                  │
//!                                  ▼
//!                      sent / failed in NotificationStore
//! ```
//!
//! Per-recipient failures are recorded and counted. Store failures during a
//! dispatch are pipeline errors: no new sends start, in-flight sends finish,
//! and the error is returned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{DEFAULT_CACHE_TTL, RecipientCache};
use crate::error::{NotificationError, NotificationResult};
use crate::events::{Event, EventRepository, EventStatus};
use crate::models::{
    BroadcastResult, DispatchStats, Notification, NotificationStatus, RecipientContact,
    StatusChange,
};
use crate::providers::{EmailGateway, GatewayReceipt, OutboundEmail};
use crate::rate_limiter::RateLimiter;
use crate::recipients::ChildRecordRepository;
use crate::repository::NotificationRepository;
use crate::templates::{EventSummary, MessageContext, MessageRenderer};
use crate::vocabulary::DisabilityTag;

/// Error recorded on notifications that never started because dispatch was cancelled.
pub const CANCELLED_ERROR: &str = "dispatch cancelled";

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RATE_WAIT: Duration = Duration::from_secs(120);

/// Sender half of a dispatch cancellation signal.
#[derive(Debug)]
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half, checked before every send is started.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_handle, signal) = cancellation_pair();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is dropped uncancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancellation_pair() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancellationHandle { tx }, CancellationSignal { rx })
}

/// Event-mode dispatch input.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub notifications: Vec<Notification>,
    pub recipients: Vec<RecipientContact>,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Controlling event, moved to `sent` or `cancelled` once dispatch ends.
    pub event: Option<Event>,
}

#[derive(Debug, Clone)]
struct SendUnit {
    notification_id: Uuid,
    contact: RecipientContact,
    subject: String,
    message: String,
    unsubscribe_token: String,
    /// Whether this unit owns its notification's lifecycle (event mode).
    tracked: bool,
}

enum Delivery {
    Sent(GatewayReceipt),
    Failed(String),
    Cancelled,
}

enum UnitOutcome {
    Sent,
    Failed { recipient: String, error: String },
}

#[derive(Clone)]
pub struct BatchDispatcher {
    store: Arc<dyn NotificationRepository>,
    events: Arc<dyn EventRepository>,
    gateway: Arc<dyn EmailGateway>,
    children: Arc<dyn ChildRecordRepository>,
    renderer: MessageRenderer,
    limiter: Arc<RateLimiter>,
    cache: Arc<RecipientCache>,
    send_timeout: Duration,
    rate_wait: Duration,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn NotificationRepository>,
        events: Arc<dyn EventRepository>,
        gateway: Arc<dyn EmailGateway>,
        children: Arc<dyn ChildRecordRepository>,
        renderer: MessageRenderer,
    ) -> Self {
        Self {
            store,
            events,
            gateway,
            children,
            renderer,
            limiter: Arc::new(RateLimiter::default()),
            cache: Arc::new(RecipientCache::with_system_clock(DEFAULT_CACHE_TTL)),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            rate_wait: DEFAULT_RATE_WAIT,
        }
    }

    /// Share a process-wide limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<RecipientCache>) -> Self {
        self.cache = cache;
        self
    }

    /// `send_timeout` bounds one gateway call; `rate_wait` bounds the wait for a token.
    pub fn with_timeouts(mut self, send_timeout: Duration, rate_wait: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.rate_wait = rate_wait;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<RecipientCache> {
        &self.cache
    }

    /// Send one email per notification and settle each notification's status.
    #[instrument(
        skip_all,
        fields(
            notifications = request.notifications.len(),
            event_id = ?request.event.as_ref().map(|e| e.id),
        )
    )]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: &CancellationSignal,
    ) -> NotificationResult<DispatchStats> {
        let DispatchRequest {
            notifications,
            recipients,
            batch_size,
            concurrency,
            event,
        } = request;

        if let Some(event) = &event {
            self.prime_cache(&recipients, &event.target_disabilities).await;
        }
        let summary = event.as_ref().map(|e| Arc::new(e.summary()));

        let ids: Vec<Uuid> = notifications.iter().map(|n| n.id).collect();
        let result = match self.build_units(notifications, recipients) {
            Ok(units) => {
                self.fan_out(units, batch_size, concurrency, summary, cancel)
                    .await
            }
            Err(err) => {
                self.fail_unstarted(ids, &err).await;
                Err(err)
            }
        };

        let Some(event) = event else {
            return result;
        };

        match result {
            Ok(stats) => {
                if cancel.is_cancelled() {
                    info!(event_id = %event.id, "Dispatch stopped by event cancellation");
                } else {
                    self.events.set_status(event.id, EventStatus::Sent, None).await?;
                }
                info!(
                    event_id = %event.id,
                    total = stats.total,
                    success = stats.success,
                    failed = stats.failed,
                    "Event dispatch finished"
                );
                Ok(stats)
            }
            Err(err) => {
                error!(event_id = %event.id, error = %err, "Event dispatch failed, cancelling event");
                if let Err(status_err) = self
                    .events
                    .set_status(event.id, EventStatus::Cancelled, Some(err.to_string()))
                    .await
                {
                    error!(event_id = %event.id, error = %status_err, "Failed to cancel event");
                }
                Err(err)
            }
        }
    }

    /// Fan a batch notification out to every recipient in its metadata and
    /// settle it as `sent`, `partial` or `failed`.
    #[instrument(skip_all, fields(notification_id = %notification.id))]
    pub async fn dispatch_batch(
        &self,
        notification: &Notification,
        batch_size: usize,
        concurrency: usize,
        cancel: &CancellationSignal,
    ) -> NotificationResult<BroadcastResult> {
        let recipients = notification.metadata.recipients.clone();

        self.store
            .transition(notification.id, StatusChange::to(NotificationStatus::Sending))
            .await?;

        let units = recipients
            .into_iter()
            .map(|contact| SendUnit {
                notification_id: notification.id,
                contact,
                subject: notification.subject.clone(),
                message: notification.message.clone(),
                unsubscribe_token: notification.unsubscribe_token.clone(),
                tracked: false,
            })
            .collect();

        let stats = match self
            .fan_out(units, batch_size, concurrency, None, cancel)
            .await
        {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "Broadcast dispatch failed");
                if let Err(status_err) = self
                    .store
                    .transition(notification.id, StatusChange::failed(err.to_string()))
                    .await
                {
                    error!(error = %status_err, "Failed to mark broadcast as failed");
                }
                return Err(err);
            }
        };

        let mut metadata = notification.metadata.clone();
        metadata.stats = Some(stats.counts());
        if let Err(err) = self.store.update_metadata(notification.id, metadata).await {
            error!(error = %err, "Failed to record broadcast stats");
            self.fail_unstarted(vec![notification.id], &err).await;
            return Err(err);
        }

        let change = if stats.failed == 0 {
            StatusChange::sent(None)
        } else if stats.success == 0 {
            StatusChange::failed(format!("all {} sends failed", stats.total))
        } else {
            StatusChange::to(NotificationStatus::Partial)
                .with_error(format!("{} of {} sends failed", stats.failed, stats.total))
        };
        let settled = self.store.transition(notification.id, change).await?;

        info!(
            status = %settled.status,
            total = stats.total,
            success = stats.success,
            failed = stats.failed,
            "Broadcast finished"
        );

        Ok(BroadcastResult {
            notification_id: notification.id,
            status: settled.status,
            stats,
        })
    }

    /// Seed the cache from a match result.
    ///
    /// A filtered match only carries the tags inside `filter`, not every tag
    /// the guardian's children have, so only unfiltered matches are cached.
    pub async fn prime_cache(
        &self,
        matched: &[RecipientContact],
        filter: &BTreeSet<DisabilityTag>,
    ) {
        if !filter.is_empty() {
            return;
        }
        for contact in matched {
            self.cache
                .prime(&contact.email, contact.disability_tags.clone())
                .await;
        }
    }

    /// Best-effort: mark notifications that a pipeline error left behind as failed.
    async fn fail_unstarted(&self, ids: Vec<Uuid>, cause: &NotificationError) {
        for id in ids {
            let change = StatusChange::failed(cause.to_string()).without_attempt();
            if let Err(err) = self.store.transition(id, change).await {
                error!(notification_id = %id, error = %err, "Failed to mark notification as failed");
            }
        }
    }

    fn build_units(
        &self,
        notifications: Vec<Notification>,
        recipients: Vec<RecipientContact>,
    ) -> NotificationResult<Vec<SendUnit>> {
        let mut contacts: HashMap<String, RecipientContact> = recipients
            .into_iter()
            .map(|contact| (contact.email.clone(), contact))
            .collect();

        notifications
            .into_iter()
            .map(|notification| {
                let email = notification.recipient_email().ok_or_else(|| {
                    NotificationError::Pipeline(format!(
                        "notification {} has no recipient",
                        notification.id
                    ))
                })?;

                let contact = contacts.remove(email).unwrap_or_else(|| RecipientContact {
                    email: email.to_string(),
                    display_name: notification
                        .metadata
                        .recipient_name
                        .clone()
                        .unwrap_or_else(|| email.to_string()),
                    disability_tags: BTreeSet::new(),
                });

                Ok(SendUnit {
                    notification_id: notification.id,
                    contact,
                    subject: notification.subject,
                    message: notification.message,
                    unsubscribe_token: notification.unsubscribe_token,
                    tracked: true,
                })
            })
            .collect()
    }

    async fn fan_out(
        &self,
        units: Vec<SendUnit>,
        batch_size: usize,
        concurrency: usize,
        event: Option<Arc<EventSummary>>,
        cancel: &CancellationSignal,
    ) -> NotificationResult<DispatchStats> {
        let batch_size = batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: JoinSet<NotificationResult<UnitOutcome>> = JoinSet::new();
        let mut stats = DispatchStats::default();
        let mut pipeline_error: Option<NotificationError> = None;
        let mut not_started = Vec::new();

        // Chunks are consecutive runs of `batch_size` units. They bound how
        // work is issued, not ordering: the semaphore spans chunk boundaries.
        let mut pending = units.into_iter().enumerate();
        while let Some((index, unit)) = pending.next() {
            if index % batch_size == 0 {
                debug!(chunk = index / batch_size + 1, "Starting chunk");
            }

            while let Some(joined) = tasks.try_join_next() {
                Self::settle(joined, &mut stats, &mut pipeline_error);
            }

            if pipeline_error.is_some() || cancel.is_cancelled() {
                not_started.push(unit);
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                not_started.push(unit);
                break;
            };

            let this = self.clone();
            let event = event.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.run_unit(unit, event.as_deref(), &cancel).await
            });
        }
        not_started.extend(pending.map(|(_, unit)| unit));

        while let Some(joined) = tasks.join_next().await {
            Self::settle(joined, &mut stats, &mut pipeline_error);
        }

        if let Some(err) = pipeline_error {
            let unstarted = not_started
                .iter()
                .filter(|unit| unit.tracked)
                .map(|unit| unit.notification_id)
                .collect();
            self.fail_unstarted(unstarted, &err).await;
            return Err(err);
        }

        if !not_started.is_empty() {
            warn!(skipped = not_started.len(), "Dispatch cancelled before all sends started");
        }
        for unit in not_started {
            if unit.tracked {
                self.store
                    .transition(
                        unit.notification_id,
                        StatusChange::failed(CANCELLED_ERROR).without_attempt(),
                    )
                    .await?;
            }
            stats.record_failure(unit.contact.email, CANCELLED_ERROR);
        }

        Ok(stats)
    }

    fn settle(
        joined: Result<NotificationResult<UnitOutcome>, JoinError>,
        stats: &mut DispatchStats,
        pipeline_error: &mut Option<NotificationError>,
    ) {
        match joined {
            Ok(Ok(UnitOutcome::Sent)) => stats.record_success(),
            Ok(Ok(UnitOutcome::Failed { recipient, error })) => {
                stats.record_failure(recipient, error)
            }
            Ok(Err(err)) => {
                pipeline_error.get_or_insert(err);
            }
            Err(join_err) => {
                pipeline_error.get_or_insert(NotificationError::Pipeline(format!(
                    "send task failed: {}",
                    join_err
                )));
            }
        }
    }

    async fn run_unit(
        &self,
        unit: SendUnit,
        event: Option<&EventSummary>,
        cancel: &CancellationSignal,
    ) -> NotificationResult<UnitOutcome> {
        if unit.tracked {
            self.store
                .transition(unit.notification_id, StatusChange::to(NotificationStatus::Sending))
                .await?;
        }

        let (change, outcome) = match self.deliver(&unit, event, cancel).await {
            Delivery::Sent(receipt) => {
                debug!(
                    notification_id = %unit.notification_id,
                    recipient = %unit.contact.email,
                    "Notification sent"
                );
                (StatusChange::sent(receipt.gateway_message_id), UnitOutcome::Sent)
            }
            Delivery::Failed(error) => {
                warn!(
                    notification_id = %unit.notification_id,
                    recipient = %unit.contact.email,
                    error = %error,
                    "Notification send failed"
                );
                (
                    StatusChange::failed(error.clone()),
                    UnitOutcome::Failed {
                        recipient: unit.contact.email.clone(),
                        error,
                    },
                )
            }
            Delivery::Cancelled => (
                StatusChange::failed(CANCELLED_ERROR).without_attempt(),
                UnitOutcome::Failed {
                    recipient: unit.contact.email.clone(),
                    error: CANCELLED_ERROR.to_string(),
                },
            ),
        };

        if unit.tracked {
            self.store.transition(unit.notification_id, change).await?;
        }
        Ok(outcome)
    }

    async fn deliver(
        &self,
        unit: &SendUnit,
        event: Option<&EventSummary>,
        cancel: &CancellationSignal,
    ) -> Delivery {
        let deadline = Instant::now() + self.rate_wait;
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Delivery::Cancelled,
            acquired = self.limiter.acquire_until(deadline) => acquired,
        };
        if !acquired {
            return Delivery::Failed(format!(
                "no send slot within {:?} of rate limiting",
                self.rate_wait
            ));
        }

        let disabilities = match self
            .cache
            .disabilities_for(&unit.contact.email, self.children.as_ref())
            .await
        {
            Ok(tags) if !tags.is_empty() => tags,
            Ok(_) => unit.contact.disability_tags.clone(),
            Err(err) => {
                warn!(recipient = %unit.contact.email, error = %err, "Disability lookup failed, using matched tags");
                unit.contact.disability_tags.clone()
            }
        };

        let rendered = match self.renderer.render(&MessageContext {
            guardian_name: &unit.contact.display_name,
            subject: &unit.subject,
            message: &unit.message,
            disabilities: &disabilities,
            unsubscribe_token: &unit.unsubscribe_token,
            event,
        }) {
            Ok(rendered) => rendered,
            Err(err) => return Delivery::Failed(err.to_string()),
        };

        let email = OutboundEmail {
            to: unit.contact.email.clone(),
            to_name: unit.contact.display_name.clone(),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            correlation_id: unit.notification_id.to_string(),
        };

        match tokio::time::timeout(self.send_timeout, self.gateway.send(&email)).await {
            Ok(Ok(receipt)) => Delivery::Sent(receipt),
            Ok(Err(err)) => Delivery::Failed(err.to_string()),
            Err(_) => Delivery::Failed(NotificationError::Timeout(self.send_timeout).to_string()),
        }
    }
}
