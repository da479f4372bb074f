// Per-request deadline. Bounds time-to-response; streaming bodies are not
// cut off once headers have been produced.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
    response::Response,
};

use crate::error::ApiError;
use crate::AppState;

pub async fn timeout_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = state.config.request_timeout();
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(timeout = ?deadline, "request exceeded deadline");
            ApiError::Cancelled.into_response()
        }
    }
}
