//! Expiration registry: schedules automatic deletion of policies whose
//! `duration_seconds` is positive.
//!
//! The registry owns no policy state. It is driven by the store's own watch
//! stream, which keeps the timer map coherent with the store: any
//! Created/Updated with a lifetime (re)arms a timer, any Deleted cancels
//! one, and a backend resync rebuilds the whole map from a fresh list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::event::ChangeEvent;
use crate::PolicyStore;

struct ExpiryEntry {
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Background component deleting time-bounded policies at T+duration.
pub struct ExpirationRegistry {
    store: Arc<dyn PolicyStore>,
    timers: Arc<DashMap<String, ExpiryEntry>>,
    cancel: CancellationToken,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationRegistry {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            timers: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            feed: Mutex::new(None),
        }
    }

    /// Subscribes to the store's watch stream and begins tracking
    /// lifetimes. Existing time-bounded policies are armed immediately.
    pub async fn start(&self) -> Result<()> {
        let mut feed = self.feed.lock().await;
        if feed.is_some() {
            return Err(StoreError::Internal(
                "expiration registry already started".to_string(),
            ));
        }

        let mut stream = self.store.watch(self.cancel.child_token()).await?;

        // Policies loaded from a persistent backend before we watched.
        Self::resync(&self.store, &self.timers, &self.cancel).await;

        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);
        let cancel = self.cancel.clone();

        *feed = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    ChangeEvent::Created(policy) | ChangeEvent::Updated(policy) => {
                        match policy.lifetime() {
                            Some(lifetime) => {
                                Self::arm(&store, &timers, &cancel, policy.name(), lifetime);
                            }
                            None => Self::disarm(&timers, policy.name()),
                        }
                    }
                    ChangeEvent::Deleted(name) => Self::disarm(&timers, &name),
                    ChangeEvent::Rebuilt => Self::resync(&store, &timers, &cancel).await,
                }
            }
            tracing::debug!("expiration registry feed stopped");
        }));

        Ok(())
    }

    /// Schedules deletion of `name` after `lifetime`. A zero lifetime
    /// disarms instead. Re-registering replaces any existing timer.
    pub fn register(&self, name: &str, lifetime: Duration) {
        Self::arm(&self.store, &self.timers, &self.cancel, name, lifetime);
    }

    /// Cancels and drops the timer for `name`; idempotent.
    pub fn cancel_timer(&self, name: &str) {
        Self::disarm(&self.timers, name);
    }

    /// Deadline of the pending deletion for `name`, if one is scheduled.
    pub fn deadline(&self, name: &str) -> Option<DateTime<Utc>> {
        self.timers.get(name).map(|entry| entry.deadline)
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancels every timer and the watch feed. Idempotent; no deletions are
    /// issued afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.feed.lock().await.take() {
            handle.abort();
        }
        self.timers.retain(|_, entry| {
            entry.handle.abort();
            false
        });
    }

    fn arm(
        store: &Arc<dyn PolicyStore>,
        timers: &Arc<DashMap<String, ExpiryEntry>>,
        cancel: &CancellationToken,
        name: &str,
        lifetime: Duration,
    ) {
        if lifetime.is_zero() {
            Self::disarm(timers, name);
            return;
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
        let store = Arc::clone(store);
        let timers_map = Arc::clone(timers);
        let token = cancel.child_token();
        let policy_name = name.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {
                    // Only drop our own entry; a re-registration may have
                    // installed a newer one in the meantime.
                    timers_map.remove_if(&policy_name, |_, entry| entry.deadline == deadline);
                    match store.delete(&policy_name).await {
                        Ok(()) => {
                            tracing::info!(policy = %policy_name, "expired policy removed");
                        }
                        Err(StoreError::NotFound(_)) => {}
                        Err(e) => {
                            tracing::warn!(policy = %policy_name, error = %e, "expiration delete failed");
                        }
                    }
                }
            }
        });

        if let Some(previous) = timers.insert(
            name.to_string(),
            ExpiryEntry { deadline, handle },
        ) {
            previous.handle.abort();
        }
    }

    fn disarm(timers: &Arc<DashMap<String, ExpiryEntry>>, name: &str) {
        if let Some((_, entry)) = timers.remove(name) {
            entry.handle.abort();
        }
    }

    /// Rebuilds the timer map from a fresh list, used at startup and after
    /// a backend reconnect.
    async fn resync(
        store: &Arc<dyn PolicyStore>,
        timers: &Arc<DashMap<String, ExpiryEntry>>,
        cancel: &CancellationToken,
    ) {
        let policies = match store.list().await {
            Ok(policies) => policies,
            Err(e) => {
                tracing::warn!(error = %e, "expiration resync list failed");
                return;
            }
        };

        let live: std::collections::HashSet<&str> =
            policies.iter().map(|p| p.name()).collect();
        let stale: Vec<String> = timers
            .iter()
            .filter(|entry| !live.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            Self::disarm(timers, &name);
        }

        for policy in &policies {
            match policy.lifetime() {
                Some(lifetime) => Self::arm(store, timers, cancel, policy.name(), lifetime),
                None => Self::disarm(timers, policy.name()),
            }
        }
    }
}
