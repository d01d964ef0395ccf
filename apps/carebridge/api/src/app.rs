//! Router assembly: the notifications API, docs, probes and cross-cutting layers.

use axum::{
    Json, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use domain_notifications::NotificationService;
use serde_json::json;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};
use utoipa::OpenApi;

use crate::health::{self, ReadyState};
use crate::openapi::ApiDoc;

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "type": "not_found",
                "message": "The requested resource was not found",
            }
        })),
    )
}

fn cors_layer(origins: &[String]) -> eyre::Result<CorsLayer> {
    let allowed = origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| eyre::eyre!("Invalid CORS_ALLOWED_ORIGIN value: {}", e))?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600)))
}

pub fn build_router(
    service: NotificationService,
    ready: ReadyState,
    cors_origins: &[String],
) -> eyre::Result<Router> {
    let router = Router::new()
        .nest("/api/notifications", domain_notifications::router(service))
        .route("/api-docs/openapi.json", get(openapi_json))
        .merge(health::health_router())
        .merge(health::ready_router(ready))
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    if cors_origins.is_empty() {
        return Ok(router);
    }
    info!(origins = ?cors_origins, "CORS enabled");
    Ok(router.layer(cors_layer(cors_origins)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use domain_notifications::providers::MockGateway;
    use domain_notifications::{DispatchConfig, MessageRenderer, NotificationStores};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(cors: &[String]) -> Router {
        let gateway = Arc::new(MockGateway::new());
        let service = NotificationService::new(
            NotificationStores::in_memory(),
            gateway.clone(),
            MessageRenderer::new("http://localhost:8080", "CareBridge").unwrap(),
            DispatchConfig::default(),
        );
        build_router(service, ReadyState { db: None, gateway }, cors).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_notifications_are_nested_under_api() {
        let response = app(&[])
            .oneshot(get("/api/notifications/recipient-count"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["count"], 0);
    }

    #[tokio::test]
    async fn test_ready_without_database_checks_email_only() {
        let response = app(&[]).oneshot(get("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["email"], "connected");
        assert!(body.get("database").is_none());
    }

    #[tokio::test]
    async fn test_health_reports_package() {
        let response = app(&[]).oneshot(get("/health")).await.unwrap();

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "carebridge_api");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_nested_paths() {
        let response = app(&[]).oneshot(get("/api-docs/openapi.json")).await.unwrap();

        let body = json_body(response).await;
        assert!(body["paths"]
            .as_object()
            .unwrap()
            .contains_key("/api/notifications/send-to-parents"));
    }

    #[tokio::test]
    async fn test_unknown_route_returns_json_404() {
        let response = app(&[]).oneshot(get("/nope/nothing/here")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["type"], "not_found");
    }

    #[test]
    fn test_invalid_cors_origin_is_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let service = NotificationService::new(
            NotificationStores::in_memory(),
            gateway.clone(),
            MessageRenderer::new("http://localhost:8080", "CareBridge").unwrap(),
            DispatchConfig::default(),
        );
        let result = build_router(
            service,
            ReadyState { db: None, gateway },
            &["http://bad\norigin".to_string()],
        );
        assert!(result.is_err());
    }
}
