// Error types for the Control Plane API
// One closed set of kinds; stringification happens only at the response
// boundary.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use faultline_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::request_id::current_request_id;

/// Unified error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// API error kinds
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("request cancelled or timed out")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Wire-format error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "already_exists",
            ApiError::Unavailable(_) => "backend_unavailable",
            ApiError::Cancelled => "cancelled",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Maps the kind onto an HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) | ApiError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => ApiError::Validation(e.to_string()),
            StoreError::NotFound(name) => ApiError::NotFound(format!(
                "policy '{name}' not found; use 'policy list' to enumerate stored policies"
            )),
            StoreError::AlreadyExists(name) => {
                ApiError::Conflict(format!("policy '{name}' already exists"))
            }
            StoreError::CapacityExceeded(cap) => {
                ApiError::Validation(format!("policy limit reached ({cap})"))
            }
            StoreError::Unavailable(msg) => ApiError::Unavailable(msg),
            StoreError::Cancelled => ApiError::Cancelled,
            StoreError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            request_id: current_request_id(),
        };

        match &self {
            ApiError::Internal(_) | ApiError::Unavailable(_) => {
                tracing::error!(error = ?self, "API error occurred");
            }
            _ => {
                tracing::warn!(error = ?self, "API error occurred");
            }
        }

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}
