//! Handler tests for the Notifications domain
//!
//! These tests verify the HTTP surface of the notifications router:
//! - Query and body parsing
//! - Response shapes and status codes
//! - Error responses
//!
//! The router is exercised on its own, without the application's nesting,
//! tracing or health endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use domain_notifications::handlers::{
    BroadcastResponse, EventDispatchResponse, RecipientCountResponse, RetryResponse,
    UNSUBSCRIBED_MESSAGE, UnsubscribeResponse,
};
use domain_notifications::providers::MockGateway;
use domain_notifications::*;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt; // For oneshot()
use uuid::Uuid;

// Helper to parse JSON response body
async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

struct TestApp {
    router: Router,
    gateway: MockGateway,
    notifications: InMemoryNotificationRepository,
    events: InMemoryEventRepository,
}

fn child(email: &str, disability: DisabilityTag) -> ChildRecord {
    ChildRecord {
        id: Uuid::new_v4(),
        first_name: "Kit".to_string(),
        last_name: "Child".to_string(),
        disability,
        guardian_first_name: "Jordan".to_string(),
        guardian_last_name: "Parent".to_string(),
        guardian_email: Some(email.to_string()),
        updated_at: Utc::now(),
    }
}

fn test_app() -> TestApp {
    let gateway = MockGateway::new();
    let notifications = InMemoryNotificationRepository::new();
    let events = InMemoryEventRepository::new();

    let stores = NotificationStores {
        notifications: Arc::new(notifications.clone()),
        events: Arc::new(events.clone()),
        children: Arc::new(InMemoryChildRecordRepository::with_records(vec![
            child("one@example.com", DisabilityTag::Autism),
            child("one@example.com", DisabilityTag::Adhd),
            child("two@example.com", DisabilityTag::Adhd),
            child("three@example.com", DisabilityTag::Dyslexia),
        ])),
        suppressions: Arc::new(InMemorySuppressionRepository::new()),
    };
    let service = NotificationService::new(
        stores,
        Arc::new(gateway.clone()),
        MessageRenderer::new("https://carebridge.test", "CareBridge").unwrap(),
        DispatchConfig::default(),
    );

    TestApp {
        router: handlers::router(service),
        gateway,
        notifications,
        events,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn seed_event(app: &TestApp, tags: &[DisabilityTag]) -> Event {
    app.events
        .upsert(Event::new("Quiet cinema morning", tags.iter().copied().collect()))
        .await
        .unwrap()
}

// ============================================================================
// Recipient Count
// ============================================================================

#[tokio::test]
async fn test_recipient_count_handler_deduplicates() {
    let app = test_app();

    let response = app
        .router
        .oneshot(get("/recipient-count?disabilityTypes=autism,ADHD"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: RecipientCountResponse = json_body(response.into_body()).await;
    assert_eq!(body.count, 2);
}

#[tokio::test]
async fn test_recipient_count_handler_without_filter_counts_everyone() {
    let app = test_app();

    let response = app.router.oneshot(get("/recipient-count")).await.unwrap();

    let body: RecipientCountResponse = json_body(response.into_body()).await;
    assert_eq!(body.count, 3);
}

#[tokio::test]
async fn test_recipient_count_handler_rejects_unknown_tag() {
    let app = test_app();

    let response = app
        .router
        .oneshot(get("/recipient-count?disabilityTypes=autism,telepathy"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["error"]["type"], "unknown_disability");
}

// ============================================================================
// Send To Parents
// ============================================================================

#[tokio::test]
async fn test_send_to_parents_handler_returns_stats() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/send-to-parents",
            json!({
                "subject": "Sports day",
                "message": "Sports day is on Friday.",
                "disabilityTypes": ["adhd"]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: BroadcastResponse = json_body(response.into_body()).await;
    assert!(body.success);
    assert_eq!(body.message, "Notification sent to 2 recipients");
    assert_eq!(body.status, Some(NotificationStatus::Sent));
    assert_eq!(body.stats.unwrap().success, 2);
    assert!(body.notification_id.is_some());
    assert_eq!(app.gateway.sent_count().await, 2);
}

#[tokio::test]
async fn test_send_to_parents_handler_without_matches_returns_404() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/send-to-parents",
            json!({
                "subject": "Signing club",
                "message": "New club starting.",
                "disabilityTypes": ["hearing"]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: BroadcastResponse = json_body(response.into_body()).await;
    assert!(!body.success);
    assert!(body.stats.is_none());
    assert!(app.notifications.is_empty().await);
}

#[tokio::test]
async fn test_send_to_parents_handler_validates_input() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/send-to-parents",
            json!({
                "subject": "",
                "message": "Body",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.gateway.calls(), 0);
}

// ============================================================================
// Event Dispatch
// ============================================================================

#[tokio::test]
async fn test_notify_event_handler_returns_notification_ids() {
    let app = test_app();
    let event = seed_event(&app, &[DisabilityTag::Autism, DisabilityTag::Dyslexia]).await;

    let response = app
        .router
        .clone()
        .oneshot(post_empty(&format!("/events/{}/notify", event.id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: EventDispatchResponse = json_body(response.into_body()).await;
    assert!(body.success);
    assert_eq!(body.notification_ids.len(), 2);
    assert_eq!(body.stats.unwrap().total, 2);

    let again = app
        .router
        .oneshot(post_empty(&format!("/events/{}/notify", event.id)))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    let body: Value = json_body(again.into_body()).await;
    assert_eq!(body["error"]["type"], "already_sent");
}

#[tokio::test]
async fn test_notify_event_handler_rejects_malformed_id() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_empty("/events/not-a-uuid/notify"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_notify_event_handler_unknown_event_returns_404() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_empty(&format!("/events/{}/notify", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_handler_reports_nothing_to_retry() {
    let app = test_app();
    let event = seed_event(&app, &[DisabilityTag::Adhd]).await;

    app.router
        .clone()
        .oneshot(post_empty(&format!("/events/{}/notify", event.id)))
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(post_empty(&format!("/events/{}/retry?maxRetries=2", event.id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: RetryResponse = json_body(response.into_body()).await;
    assert!(body.success);
    assert_eq!(body.stats.total, 0);
}

#[tokio::test]
async fn test_cancel_handler_returns_204() {
    let app = test_app();
    let event = seed_event(&app, &[DisabilityTag::Adhd]).await;

    let response = app
        .router
        .oneshot(post_empty(&format!("/events/{}/cancel", event.id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let stored = app.events.get(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Cancelled);
}

// ============================================================================
// Unsubscribe & Delivery Signals
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_handler_always_succeeds() {
    let app = test_app();

    for request in [post_empty("/unsubscribe/unknown-token"), get("/unsubscribe/unknown-token")] {
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: UnsubscribeResponse = json_body(response.into_body()).await;
        assert!(body.success);
        assert_eq!(body.message, UNSUBSCRIBED_MESSAGE);
    }
}

#[tokio::test]
async fn test_delivery_signal_handler_applies_open() {
    let app = test_app();
    let event = seed_event(&app, &[DisabilityTag::Dyslexia]).await;
    app.router
        .clone()
        .oneshot(post_empty(&format!("/events/{}/notify", event.id)))
        .await
        .unwrap();
    let notification = app.notifications.all().await.remove(0);

    let response = app
        .router
        .oneshot(post_json(
            "/delivery-signals",
            json!({
                "gatewayMessageId": notification.gateway_message_id,
                "signal": "opened"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Notification = json_body(response.into_body()).await;
    assert_eq!(body.id, notification.id);
    assert_eq!(body.status, NotificationStatus::Opened);
}

#[tokio::test]
async fn test_delivery_signal_handler_requires_identifier() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post_json("/delivery-signals", json!({ "signal": "delivered" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Get & Delete
// ============================================================================

#[tokio::test]
async fn test_get_and_delete_notification_handlers() {
    let app = test_app();
    let event = seed_event(&app, &[DisabilityTag::Dyslexia]).await;
    app.router
        .clone()
        .oneshot(post_empty(&format!("/events/{}/notify", event.id)))
        .await
        .unwrap();
    let id = app.notifications.all().await.remove(0).id;

    let response = app.router.clone().oneshot(get(&format!("/{}", id))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Notification = json_body(response.into_body()).await;
    assert_eq!(body.recipient_id.as_deref(), Some("three@example.com"));

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/{}", id))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.router.oneshot(get(&format!("/{}", id))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
