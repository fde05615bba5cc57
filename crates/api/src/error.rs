//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;

use crate::identity::IdentityError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// No usable credentials.
    Unauthorized(IdentityError),
    /// Authenticated but not allowed.
    Forbidden(String),
    Saga(SagaError),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        metrics::counter!("api_rejected_requests_total", "status" => status.as_u16().to_string())
            .increment(1);
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::Contended { .. } => (StatusCode::CONFLICT, err.to_string()),
        SagaError::Bus(bus_err) if bus_err.is_transient() => {
            tracing::warn!(error = %err, "bus unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "saga operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        ApiError::Unauthorized(err)
    }
}
