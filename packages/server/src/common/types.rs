//! Shared HTTP envelope and error types.
//!
//! Every JSON response goes out as `{success, data?, error?, timestamp}`.
//! Component errors map onto a small HTTP taxonomy: protocol errors are 400,
//! missing resources 404, resource exhaustion 503, everything else 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Uniform JSON response envelope.
#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::kernel::jobs::QueueError> for ApiError {
    fn from(err: crate::kernel::jobs::QueueError) -> Self {
        use crate::kernel::jobs::QueueError;
        match err {
            QueueError::NotFound(id) => ApiError::NotFound(format!("job not found: {id}")),
            QueueError::PayloadTooLarge { .. } => ApiError::BadRequest(err.to_string()),
            QueueError::Terminal { .. } => ApiError::BadRequest(err.to_string()),
            QueueError::Storage(_) | QueueError::Serde(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::kernel::scheduler::SchedulerError> for ApiError {
    fn from(err: crate::kernel::scheduler::SchedulerError) -> Self {
        use crate::kernel::scheduler::SchedulerError;
        match err {
            SchedulerError::InvalidCron { .. } => ApiError::BadRequest(err.to_string()),
            SchedulerError::NotFound(id) => {
                ApiError::NotFound(format!("scheduled job not found: {id}"))
            }
            SchedulerError::Queue(queue_err) => queue_err.into(),
            SchedulerError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::domains::sync::engine::SyncError> for ApiError {
    fn from(err: crate::domains::sync::engine::SyncError) -> Self {
        use crate::domains::sync::engine::SyncError;
        use crate::domains::sync::source::SourceError;
        match &err {
            SyncError::Source(SourceError::Api { status: 404, .. }) => {
                ApiError::NotFound(err.to_string())
            }
            SyncError::Source(source) if source.is_retryable() => {
                ApiError::Unavailable(err.to_string())
            }
            SyncError::Source(SourceError::Api { status, .. }) if *status < 500 => {
                ApiError::BadRequest(err.to_string())
            }
            SyncError::Conflict(_) => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::domains::sync::store::StoreError> for ApiError {
    fn from(err: crate::domains::sync::store::StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let body = ApiEnvelope::<()>::err(self.to_string());
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_serializes_without_error_field() {
        let envelope = ApiEnvelope::ok(serde_json::json!({"n": 1}));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("timestamp"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn err_envelope_carries_message() {
        let envelope = ApiEnvelope::<()>::err("boom");
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("boom"));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
