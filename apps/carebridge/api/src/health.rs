//! Liveness and readiness endpoints.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use domain_notifications::EmailGateway;
use futures::future::join_all;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: &'static str,
    pub version: &'static str,
}

/// A boxed future for health checks with a string error
pub type HealthCheckFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Dependencies probed by `/ready`.
#[derive(Clone)]
pub struct ReadyState {
    /// `None` when running on in-memory stores.
    pub db: Option<DatabaseConnection>,
    pub gateway: Arc<dyn EmailGateway>,
}

/// Run every check concurrently and report each as connected or disconnected.
pub async fn run_health_checks(checks: Vec<(&str, HealthCheckFuture<'_>)>) -> (StatusCode, Json<Value>) {
    let names: Vec<_> = checks.iter().map(|(name, _)| *name).collect();
    let results = join_all(checks.into_iter().map(|(_, check)| check)).await;

    let mut body = Map::new();
    let mut all_healthy = true;
    for (name, result) in names.into_iter().zip(results) {
        let status = match result {
            Ok(()) => "connected",
            Err(e) => {
                tracing::error!(check = name, error = %e, "Readiness check failed");
                all_healthy = false;
                "disconnected"
            }
        };
        body.insert(name.to_string(), json!(status));
    }
    body.insert(
        "status".to_string(),
        json!(if all_healthy { "ready" } else { "not ready" }),
    );

    let code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(Value::Object(body)))
}

pub async fn health_handler() -> Response {
    let response = HealthResponse {
        status: "healthy",
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    };
    (StatusCode::OK, Json(response)).into_response()
}

pub async fn ready_handler(State(state): State<ReadyState>) -> Response {
    let mut checks: Vec<(&str, HealthCheckFuture<'_>)> = vec![(
        "email",
        Box::pin(async {
            match state.gateway.health_check().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("{} gateway reported unhealthy", state.gateway.name())),
                Err(e) => Err(e.to_string()),
            }
        }),
    )];

    if let Some(db) = &state.db {
        checks.push((
            "database",
            Box::pin(async move {
                database::postgres::check_health(db)
                    .await
                    .map_err(|e| e.to_string())
            }),
        ));
    }

    run_health_checks(checks).await.into_response()
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(health_handler))
}

pub fn ready_router(state: ReadyState) -> Router {
    Router::new()
        .route("/ready", get(ready_handler))
        .with_state(state)
}
