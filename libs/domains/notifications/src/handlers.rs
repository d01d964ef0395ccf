use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{
    DeliveryCounts, DeliverySignalKind, DeliverySignalRequest, DispatchOutcome, DispatchStats,
    Notification, NotificationKind, NotificationMetadata, NotificationStatus, RecipientContact,
    RecipientFailure, SendToParentsRequest,
};
use crate::service::NotificationService;
use crate::vocabulary::{DisabilityTag, parse_csv};

pub const UNSUBSCRIBED_MESSAGE: &str = "You have been unsubscribed from these notifications.";
const NO_RECIPIENTS_MESSAGE: &str = "No recipients found for the selected disability types";

/// OpenAPI documentation for the notifications API
#[derive(OpenApi)]
#[openapi(
    paths(
        recipient_count,
        send_to_parents,
        notify_event,
        retry_event,
        cancel_event,
        unsubscribe,
        unsubscribe_link,
        delivery_signal,
        get_notification,
        delete_notification,
    ),
    components(schemas(
        Notification,
        NotificationStatus,
        NotificationKind,
        NotificationMetadata,
        RecipientContact,
        DeliveryCounts,
        DispatchStats,
        RecipientFailure,
        DisabilityTag,
        SendToParentsRequest,
        DeliverySignalRequest,
        DeliverySignalKind,
        RecipientCountResponse,
        BroadcastResponse,
        EventDispatchResponse,
        RetryResponse,
        UnsubscribeResponse,
    )),
    tags((name = "notifications", description = "Parent notification dispatch"))
)]
pub struct ApiDoc;

/// Router for the notifications API, to be nested under `/api/notifications`.
pub fn router(service: NotificationService) -> Router {
    let shared_service = Arc::new(service);

    Router::new()
        .route("/recipient-count", get(recipient_count))
        .route("/send-to-parents", post(send_to_parents))
        .route("/events/{id}/notify", post(notify_event))
        .route("/events/{id}/retry", post(retry_event))
        .route("/events/{id}/cancel", post(cancel_event))
        .route("/unsubscribe/{token}", post(unsubscribe).get(unsubscribe_link))
        .route("/delivery-signals", post(delivery_signal))
        .route("/{id}", get(get_notification).delete(delete_notification))
        .with_state(shared_service)
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RecipientCountQuery {
    /// Comma separated disability tags; omit for every guardian.
    pub disability_types: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct NotifyEventQuery {
    pub sender_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RetryQuery {
    /// Skip notifications that already failed this many times.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RecipientCountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DispatchStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NotificationStatus>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventDispatchResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DispatchStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryResponse {
    pub success: bool,
    pub message: String,
    pub stats: DispatchStats,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UnsubscribeResponse {
    pub success: bool,
    pub message: String,
}

fn parse_id(raw: &str, what: &str) -> NotificationResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| NotificationError::Validation(format!("Invalid {} ID", what)))
}

fn sent_summary(stats: &DispatchStats) -> String {
    if stats.failed == 0 {
        format!("Notification sent to {} recipients", stats.success)
    } else {
        format!(
            "Notification sent to {} of {} recipients ({} failed)",
            stats.success, stats.total, stats.failed
        )
    }
}

/// Number of guardians a send would reach
#[utoipa::path(
    get,
    path = "/recipient-count",
    tag = "notifications",
    params(RecipientCountQuery),
    responses(
        (status = 200, description = "Distinct recipient count", body = RecipientCountResponse),
        (status = 400, description = "Unknown disability type")
    )
)]
pub async fn recipient_count(
    State(service): State<Arc<NotificationService>>,
    Query(query): Query<RecipientCountQuery>,
) -> NotificationResult<Json<RecipientCountResponse>> {
    let tags = parse_csv(query.disability_types.as_deref().unwrap_or_default())?;
    let count = service.recipient_count(&tags).await?;
    Ok(Json(RecipientCountResponse { count }))
}

/// Broadcast a message to guardians matching the selected disability types
#[utoipa::path(
    post,
    path = "/send-to-parents",
    tag = "notifications",
    request_body = SendToParentsRequest,
    responses(
        (status = 200, description = "Broadcast dispatched", body = BroadcastResponse),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "No recipients matched", body = BroadcastResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn send_to_parents(
    State(service): State<Arc<NotificationService>>,
    Json(input): Json<SendToParentsRequest>,
) -> NotificationResult<Response> {
    let response = match service.send_broadcast(input).await? {
        DispatchOutcome::Completed(result) => {
            info!(notification_id = %result.notification_id, "Broadcast request completed");
            (
                StatusCode::OK,
                Json(BroadcastResponse {
                    success: true,
                    message: sent_summary(&result.stats),
                    stats: Some(result.stats),
                    notification_id: Some(result.notification_id),
                    status: Some(result.status),
                }),
            )
                .into_response()
        }
        DispatchOutcome::NoRecipients => (
            StatusCode::NOT_FOUND,
            Json(BroadcastResponse {
                success: false,
                message: NO_RECIPIENTS_MESSAGE.to_string(),
                stats: None,
                notification_id: None,
                status: None,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// Notify every guardian targeted by an event
#[utoipa::path(
    post,
    path = "/events/{id}/notify",
    tag = "notifications",
    params(
        ("id" = String, Path, description = "Event ID"),
        NotifyEventQuery
    ),
    responses(
        (status = 200, description = "Event notifications dispatched", body = EventDispatchResponse),
        (status = 400, description = "Event already sent"),
        (status = 404, description = "Event not found or no recipients matched"),
        (status = 500, description = "Dispatch pipeline failed; event cancelled")
    )
)]
pub async fn notify_event(
    State(service): State<Arc<NotificationService>>,
    Path(id): Path<String>,
    Query(query): Query<NotifyEventQuery>,
) -> NotificationResult<Response> {
    let event_id = parse_id(&id, "event")?;

    let response = match service.notify_event(event_id, query.sender_id).await? {
        DispatchOutcome::Completed(result) => (
            StatusCode::OK,
            Json(EventDispatchResponse {
                success: true,
                message: sent_summary(&result.stats),
                stats: Some(result.stats),
                notification_ids: result.notification_ids,
            }),
        )
            .into_response(),
        DispatchOutcome::NoRecipients => (
            StatusCode::NOT_FOUND,
            Json(EventDispatchResponse {
                success: false,
                message: NO_RECIPIENTS_MESSAGE.to_string(),
                stats: None,
                notification_ids: Vec::new(),
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// Retry failed notifications of an event
#[utoipa::path(
    post,
    path = "/events/{id}/retry",
    tag = "notifications",
    params(
        ("id" = String, Path, description = "Event ID"),
        RetryQuery
    ),
    responses(
        (status = 200, description = "Retry dispatched", body = RetryResponse),
        (status = 404, description = "Event not found")
    )
)]
pub async fn retry_event(
    State(service): State<Arc<NotificationService>>,
    Path(id): Path<String>,
    Query(query): Query<RetryQuery>,
) -> NotificationResult<Json<RetryResponse>> {
    let event_id = parse_id(&id, "event")?;
    let stats = service.retry_failed(event_id, query.max_retries).await?;

    let message = if stats.total == 0 {
        "No failed notifications to retry".to_string()
    } else {
        format!("Retried {} notifications, {} succeeded", stats.total, stats.success)
    };
    Ok(Json(RetryResponse {
        success: true,
        message,
        stats,
    }))
}

/// Cancel an event and stop any dispatch in progress
#[utoipa::path(
    post,
    path = "/events/{id}/cancel",
    tag = "notifications",
    params(("id" = String, Path, description = "Event ID")),
    responses(
        (status = 204, description = "Event cancelled"),
        (status = 400, description = "Event already sent"),
        (status = 404, description = "Event not found")
    )
)]
pub async fn cancel_event(
    State(service): State<Arc<NotificationService>>,
    Path(id): Path<String>,
) -> NotificationResult<StatusCode> {
    let event_id = parse_id(&id, "event")?;
    service.cancel_event(event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unsubscribe using the token from a notification email
///
/// Always succeeds so that callers cannot probe which tokens exist.
#[utoipa::path(
    post,
    path = "/unsubscribe/{token}",
    tag = "notifications",
    params(("token" = String, Path, description = "Unsubscribe token")),
    responses(
        (status = 200, description = "Unsubscribed", body = UnsubscribeResponse)
    )
)]
pub async fn unsubscribe(
    State(service): State<Arc<NotificationService>>,
    Path(token): Path<String>,
) -> NotificationResult<Json<UnsubscribeResponse>> {
    service.unsubscribe(&token).await?;
    Ok(Json(UnsubscribeResponse {
        success: true,
        message: UNSUBSCRIBED_MESSAGE.to_string(),
    }))
}

/// Unsubscribe link followed from a mail client
#[utoipa::path(
    get,
    path = "/unsubscribe/{token}",
    tag = "notifications",
    params(("token" = String, Path, description = "Unsubscribe token")),
    responses(
        (status = 200, description = "Unsubscribed", body = UnsubscribeResponse)
    )
)]
pub async fn unsubscribe_link(
    state: State<Arc<NotificationService>>,
    token: Path<String>,
) -> NotificationResult<Json<UnsubscribeResponse>> {
    unsubscribe(state, token).await
}

/// Record delivery feedback from the email gateway
#[utoipa::path(
    post,
    path = "/delivery-signals",
    tag = "notifications",
    request_body = DeliverySignalRequest,
    responses(
        (status = 200, description = "Signal applied", body = Notification),
        (status = 400, description = "Invalid transition or missing identifier"),
        (status = 404, description = "Notification not found")
    )
)]
pub async fn delivery_signal(
    State(service): State<Arc<NotificationService>>,
    Json(input): Json<DeliverySignalRequest>,
) -> NotificationResult<Json<Notification>> {
    let notification = service
        .apply_delivery_signal(
            input.notification_id,
            input.gateway_message_id.as_deref(),
            input.signal(),
        )
        .await?;
    Ok(Json(notification))
}

/// Get a notification by ID
#[utoipa::path(
    get,
    path = "/{id}",
    tag = "notifications",
    params(("id" = String, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Notification found", body = Notification),
        (status = 400, description = "Invalid notification ID"),
        (status = 404, description = "Notification not found")
    )
)]
pub async fn get_notification(
    State(service): State<Arc<NotificationService>>,
    Path(id): Path<String>,
) -> NotificationResult<Json<Notification>> {
    let notification_id = parse_id(&id, "notification")?;
    Ok(Json(service.get_notification(notification_id).await?))
}

/// Delete a notification
#[utoipa::path(
    delete,
    path = "/{id}",
    tag = "notifications",
    params(("id" = String, Path, description = "Notification ID")),
    responses(
        (status = 204, description = "Notification deleted"),
        (status = 400, description = "Invalid notification ID"),
        (status = 404, description = "Notification not found")
    )
)]
pub async fn delete_notification(
    State(service): State<Arc<NotificationService>>,
    Path(id): Path<String>,
) -> NotificationResult<StatusCode> {
    let notification_id = parse_id(&id, "notification")?;
    service.delete_notification(notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
