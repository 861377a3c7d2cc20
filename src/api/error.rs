//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::db::DatabaseError;
use crate::pipeline::classification::ClassifyError;
use crate::pipeline::metrics::MetricsError;
use crate::pipeline::sampling::SamplingError;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Sealed: {0}")]
    Sealed(String),
    #[error("Model gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail),
            ApiError::Conflict(detail) => (StatusCode::CONFLICT, "CONFLICT", detail),
            ApiError::Sealed(detail) => (StatusCode::FORBIDDEN, "PREDICTION_SEALED", detail),
            ApiError::GatewayUnavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, "GATEWAY_UNAVAILABLE", detail)
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        let message = err.to_string();
        match err {
            ClassifyError::Database(e) => e.into(),
            ClassifyError::GatewayUnavailable(_) => ApiError::GatewayUnavailable(message),
            ClassifyError::InvalidConfig(_) => ApiError::BadRequest(message),
            ClassifyError::RunNotFound(_) | ClassifyError::DeadLetterNotFound(_) => ApiError::NotFound(message),
            ClassifyError::AlreadyRunning(_) | ClassifyError::Abandoned(_) | ClassifyError::AlreadyResolved(_) => {
                ApiError::Conflict(message)
            }
        }
    }
}

impl From<SamplingError> for ApiError {
    fn from(err: SamplingError) -> Self {
        let message = err.to_string();
        match err {
            SamplingError::Database(e) => e.into(),
            SamplingError::InvalidRequest(_) => ApiError::BadRequest(message),
            SamplingError::RunNotFound(_) | SamplingError::SetNotFound(_) | SamplingError::ItemNotFound(_) => {
                ApiError::NotFound(message)
            }
            SamplingError::LabelConflict(_) => ApiError::Conflict(message),
            SamplingError::PredictionSealed(_) => ApiError::Sealed(message),
        }
    }
}

impl From<MetricsError> for ApiError {
    fn from(err: MetricsError) -> Self {
        let message = err.to_string();
        match err {
            MetricsError::Database(e) => e.into(),
            MetricsError::SetNotFound(_) => ApiError::NotFound(message),
            MetricsError::InvalidConfidenceLevel(_) => ApiError::BadRequest(message),
        }
    }
}
