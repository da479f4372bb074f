// Faultline Control Plane
//
// Accepts declarative HTTP-fault policies over REST, persists them, and
// fans a compiled, consistent view of the active rule set out to
// data-plane subscribers over server-sent events.

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::{response::IntoResponse, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faultline_distributor::ConfigDistributor;
use faultline_store::{EtcdPolicyStore, ExpirationRegistry, MemoryPolicyStore, PolicyStore};

use config::{AppConfig, LogConfig, LogFormat, StorageBackend};
use error::ApiError;
use metrics::Metrics;
use middleware::{
    recover::recover_middleware, request_id::request_id_middleware, timeout::timeout_middleware,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn PolicyStore>,
    pub distributor: Arc<ConfigDistributor>,
    pub expiry: Arc<ExpirationRegistry>,
    pub metrics: Arc<Metrics>,
}

/// Constructs the root application state: store backend, distributor, and
/// expiration registry, wired together exactly once per process lifetime.
pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn PolicyStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryPolicyStore::new(config.max_policies())),
        StorageBackend::Kv => Arc::new(
            EtcdPolicyStore::connect(
                &config.storage.kv_endpoints,
                config.storage.key_prefix.clone(),
                config.max_policies(),
            )
            .await?,
        ),
    };

    let distributor = ConfigDistributor::new(Arc::clone(&store), config.distribution());
    distributor.start().await?;

    let expiry = Arc::new(ExpirationRegistry::new(Arc::clone(&store)));
    expiry.start().await?;

    Ok(AppState {
        config,
        store,
        distributor,
        expiry,
        metrics: Arc::new(Metrics::new()?),
    })
}

/// Creates the application router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(recover_middleware))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            timeout_middleware,
        ));

    Router::new()
        .merge(routes::create_api_router())
        .with_state(state)
        .layer(middleware_stack)
        .fallback(not_found_handler)
}

/// 404 handler
async fn not_found_handler() -> impl IntoResponse {
    ApiError::NotFound("endpoint not found".to_string()).into_response()
}

/// Binds the listener and serves until the shutdown signal fires, then runs
/// the shutdown cascade: streaming subscribers are closed so open
/// connections drain, the listener stops, timers are cancelled, and the
/// backend is disconnected.
pub async fn serve_with_shutdown(
    state: AppState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state.clone());

    let graceful = {
        let state = state.clone();
        async move {
            shutdown.await;
            tracing::info!("shutdown signal received, draining");
            // Ends every open config stream; without this, long-lived SSE
            // connections would hold the drain forever.
            state.distributor.stop().await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    state.distributor.stop().await;
    state.expiry.shutdown().await;
    state.store.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Runs the control plane until SIGTERM/ctrl-c.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let state = build_state(config.clone()).await?;
    let listener = TcpListener::bind(&config.server.listen_address).await?;
    tracing::info!(
        address = %config.server.listen_address,
        backend = ?config.storage.backend,
        "starting Faultline control plane"
    );

    serve_with_shutdown(state, listener, shutdown_signal()).await
}

/// Resolves on SIGTERM or ctrl-c.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initializes the tracing subscriber per the logging configuration.
pub fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log.level.as_filter()));

    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let state = build_state(AppConfig::default()).await.unwrap();
        create_router(state)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_found() {
        let app = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("faultline_policies"));
    }
}
