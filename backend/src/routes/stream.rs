// GET /v1/config/stream - server-sent-events feed of compiled rule sets
//
// On connect the subscriber is registered with the distributor and the
// current snapshot is already waiting in its buffer; it goes out as an
// event named `snapshot`, every later one as `update`. The subscriber is
// released when the client disconnects, when it is evicted as slow, or at
// shutdown.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
};
use faultline_distributor::{ConfigDistributor, SubscriberId, Subscription};
use futures::stream::Stream;

use crate::{error::ApiError, AppState};

pub async fn config_stream(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state
        .distributor
        .register()
        .await
        .map_err(|_| ApiError::Unavailable("server is shutting down".to_string()))?;

    tracing::info!(subscriber = %subscription.id, "config stream opened");

    let guard = UnregisterGuard {
        id: subscription.id,
        distributor: Arc::clone(&state.distributor),
    };
    let stream = snapshot_stream(subscription, guard);
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.keep_alive()));

    Ok(([(header::CACHE_CONTROL, "no-cache")], sse))
}

struct StreamState {
    subscription: Subscription,
    first: bool,
    _guard: UnregisterGuard,
}

fn snapshot_stream(
    subscription: Subscription,
    guard: UnregisterGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let initial = StreamState {
        subscription,
        first: true,
        _guard: guard,
    };

    futures::stream::unfold(initial, |mut state| async move {
        let snapshot = tokio::select! {
            _ = state.subscription.closed.cancelled() => return None,
            received = state.subscription.rx.recv() => received?,
        };

        let name = if state.first { "snapshot" } else { "update" };
        state.first = false;

        let data = match serde_json::to_string(&*snapshot) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "compiled rule set failed to serialize");
                return None;
            }
        };

        let event = Event::default()
            .event(name)
            .id(snapshot.version.clone())
            .data(data);
        Some((Ok(event), state))
    })
}

/// Releases the subscriber when the SSE body is dropped, whichever way the
/// connection ends.
struct UnregisterGuard {
    id: SubscriberId,
    distributor: Arc<ConfigDistributor>,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        let id = self.id;
        let distributor = Arc::clone(&self.distributor);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                distributor.unregister(id).await;
                tracing::info!(subscriber = %id, "config stream closed");
            });
        }
    }
}
