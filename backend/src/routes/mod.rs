// API route handlers

pub mod policies;
pub mod stream;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use crate::{metrics, AppState};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Creates the API router with all routes
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .nest("/v1/policies", policies::routes())
        .route("/v1/config/stream", get(stream::config_stream))
        .route("/v1/health", get(health_handler))
        .route("/v1/metrics", get(metrics::metrics_handler))
}

/// GET /v1/health - liveness probe
async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}
