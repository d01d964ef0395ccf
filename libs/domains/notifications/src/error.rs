//! Error types for the notifications domain.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::NotificationStatus;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Malformed input rejected before any recipient resolution.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A disability tag outside the recognised vocabulary.
    #[error("Unknown disability type: '{0}'")]
    UnknownDisability(String),

    /// The event has already been notified.
    #[error("Notifications for event {0} have already been sent")]
    AlreadySent(Uuid),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The store refused a lifecycle change.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    /// A single recipient could not be reached.
    #[error("Send to {recipient} failed: {reason}")]
    RecipientSend { recipient: String, reason: String },

    /// A send did not settle within its time budget.
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Email provider error.
    #[error("Email provider error: {0}")]
    Provider(String),

    /// Template rendering error.
    #[error("Template rendering error: {0}")]
    Template(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Unexpected failure in matching, persistence or orchestration.
    #[error("Dispatch pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NotificationError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        NotificationError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::Validation(_)
            | NotificationError::UnknownDisability(_)
            | NotificationError::AlreadySent(_)
            | NotificationError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotificationError::RecipientSend { .. } | NotificationError::Provider(_) => {
                StatusCode::BAD_GATEWAY
            }
            NotificationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            NotificationError::Template(_)
            | NotificationError::Database(_)
            | NotificationError::Pipeline(_)
            | NotificationError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            NotificationError::Validation(_) => "validation_error",
            NotificationError::UnknownDisability(_) => "unknown_disability",
            NotificationError::AlreadySent(_) => "already_sent",
            NotificationError::NotFound { .. } => "not_found",
            NotificationError::InvalidTransition { .. } => "invalid_transition",
            NotificationError::RecipientSend { .. } => "recipient_send_error",
            NotificationError::Timeout(_) => "timeout",
            NotificationError::Provider(_) => "provider_error",
            NotificationError::Template(_)
            | NotificationError::Database(_)
            | NotificationError::Pipeline(_)
            | NotificationError::Config(_) => "internal_error",
        }
    }
}

impl From<sea_orm::DbErr> for NotificationError {
    fn from(err: sea_orm::DbErr) -> Self {
        NotificationError::Database(err.to_string())
    }
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::Template(err.to_string())
    }
}

impl From<handlebars::TemplateError> for NotificationError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotificationError::Template(err.to_string())
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::Provider(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Pipeline(format!("JSON serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        NotificationError::Validation(err.to_string())
    }
}

impl From<core_config::ConfigError> for NotificationError {
    fn from(err: core_config::ConfigError) -> Self {
        NotificationError::Config(err.to_string())
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            tracing::error!(error = %self, "Notification request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(
            NotificationError::UnknownDisability("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotificationError::AlreadySent(Uuid::nil()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotificationError::not_found("Event", Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let response = NotificationError::Database("password=hunter2".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
