// Prometheus-style metrics for the /v1/metrics endpoint

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};
use faultline_distributor::DistributorStats;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::ApiError;
use crate::AppState;

/// Registry plus the gauges and counters exported by the control plane.
pub struct Metrics {
    registry: Registry,
    policies: IntGauge,
    subscribers: IntGauge,
    broadcasts: IntCounter,
    updates_dropped: IntCounter,
    evictions: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let policies = IntGauge::new(
            "faultline_policies",
            "Number of stored fault-injection policies",
        )?;
        let subscribers = IntGauge::new(
            "faultline_subscribers",
            "Number of connected config-stream subscribers",
        )?;
        let broadcasts = IntCounter::new(
            "faultline_broadcasts_total",
            "Compiled rule-set broadcasts performed",
        )?;
        let updates_dropped = IntCounter::new(
            "faultline_updates_dropped_total",
            "Updates dropped because a subscriber buffer was full",
        )?;
        let evictions = IntCounter::new(
            "faultline_subscriber_evictions_total",
            "Subscribers evicted for falling too far behind",
        )?;

        registry.register(Box::new(policies.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(updates_dropped.clone()))?;
        registry.register(Box::new(evictions.clone()))?;

        Ok(Self {
            registry,
            policies,
            subscribers,
            broadcasts,
            updates_dropped,
            evictions,
        })
    }

    /// Updates the exported values and renders the text exposition format.
    pub fn render(
        &self,
        policies: Option<usize>,
        subscribers: usize,
        stats: DistributorStats,
    ) -> Result<String, prometheus::Error> {
        if let Some(count) = policies {
            self.policies.set(count as i64);
        }
        self.subscribers.set(subscribers as i64);
        advance(&self.broadcasts, stats.broadcasts);
        advance(&self.updates_dropped, stats.updates_dropped);
        advance(&self.evictions, stats.evictions);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

/// Counters are monotonic; bring the exported value up to the live total.
fn advance(counter: &IntCounter, total: u64) {
    counter.inc_by(total.saturating_sub(counter.get()));
}

/// GET /v1/metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    // Scrapes stay best-effort: a briefly unreachable backend keeps the
    // previous gauge value instead of failing the whole endpoint.
    let policies = match state.store.list().await {
        Ok(policies) => Some(policies.len()),
        Err(e) => {
            tracing::warn!(error = %e, "metrics scrape could not list policies");
            None
        }
    };
    let subscribers = state.distributor.subscriber_count().await;
    let stats = state.distributor.stats();

    let body = state
        .metrics
        .render(policies, subscribers, stats)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
