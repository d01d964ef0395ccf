//! Notifications Domain
//!
//! Targeted email notifications to the guardians of children with given
//! disability classifications.
//!
//! # Features
//!
//! - Recipient matching by disability tag with per-guardian deduplication
//! - Broadcast sends tracked as a single batch notification
//! - Event-driven sends with one tracked notification per guardian
//! - Bounded fan-out with a process-wide rate limit and per-send timeout
//! - Delivery signals, unsubscribe links and an email suppression list
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   API Handler   │  ← Validates input, maps outcomes to responses
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ NotificationSvc │  ← Matches recipients, persists notifications
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ BatchDispatcher │  ← Chunked, rate limited, cancellable fan-out
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  Email Gateway  │  ← SMTP, SendGrid or mock
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{
//!     DispatchConfig, MessageRenderer, NotificationService, NotificationStores,
//!     providers::MockGateway,
//! };
//!
//! let renderer = MessageRenderer::new("https://carebridge.example", "CareBridge")?;
//! let service = NotificationService::new(
//!     NotificationStores::in_memory(),
//!     Arc::new(MockGateway::new()),
//!     renderer,
//!     DispatchConfig::default(),
//! );
//!
//! let outcome = service.notify_event(event_id, None).await?;
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod postgres;
pub mod providers;
pub mod rate_limiter;
pub mod recipients;
pub mod repository;
pub mod service;
pub mod suppression;
pub mod templates;
pub mod vocabulary;

// Re-export commonly used types
pub use config::DispatchConfig;
pub use dispatcher::{BatchDispatcher, CancellationHandle, CancellationSignal, cancellation_pair};
pub use error::{NotificationError, NotificationResult};
pub use events::{Event, EventRepository, EventStatus, InMemoryEventRepository};
pub use handlers::{ApiDoc, router};
pub use models::{
    BroadcastResult, DeliverySignal, DispatchOutcome, DispatchStats, EventDispatchResult,
    Notification, NotificationStatus, RecipientContact, SendToParentsRequest,
};
pub use postgres::{
    PgChildRecordRepository, PgEventRepository, PgNotificationRepository,
    PgSuppressionRepository, ensure_schema,
};
pub use providers::{EmailConfig, EmailGateway, gateway_from_env};
pub use recipients::{ChildRecord, InMemoryChildRecordRepository, RecipientMatcher};
pub use repository::{InMemoryNotificationRepository, NotificationRepository};
pub use service::{NotificationService, NotificationStores};
pub use suppression::{InMemorySuppressionRepository, SuppressionRepository};
pub use templates::MessageRenderer;
pub use vocabulary::DisabilityTag;
