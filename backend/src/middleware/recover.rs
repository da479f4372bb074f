// Panic isolation: a panicking handler becomes a 500 carrying the request
// id; the process lives.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::{extract::Request, middleware::Next, response::IntoResponse, response::Response};
use futures::FutureExt;

use crate::error::ApiError;

pub async fn recover_middleware(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            tracing::error!(panic = %detail, "request handler panicked");
            ApiError::Internal(format!("handler panicked: {detail}")).into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_panic_becomes_500() {
        async fn exploding() -> &'static str {
            panic!("boom");
        }

        let app = Router::new()
            .route("/", get(exploding))
            .layer(axum::middleware::from_fn(recover_middleware));

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("internal"));
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn test_healthy_requests_pass_through() {
        async fn fine() -> &'static str {
            "ok"
        }

        let app = Router::new()
            .route("/", get(fine))
            .layer(axum::middleware::from_fn(recover_middleware));

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
