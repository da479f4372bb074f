//! The distributor proper: one background loop watching the store, a
//! wait-free snapshot cache, and concurrent non-blocking fan-out.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use faultline_policy::{compile, validate_compiled, CompiledRuleSet};
use faultline_store::{PolicyStore, StoreError, WatchStream};
use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::subscriber::{SubscriberHandle, SubscriberId, Subscription};
use crate::DistributorError;

/// Delay before re-establishing a failed or ended watch.
const WATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How long `stop` waits for the background loop before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Distribution tunables.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Depth of each subscriber's outbound buffer.
    pub subscriber_buffer: usize,
    /// Consecutive failed enqueues after which a slow subscriber is evicted.
    pub max_consecutive_misses: u32,
    /// Upper bound on one broadcast fan-out.
    pub send_deadline: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 16,
            max_consecutive_misses: 8,
            send_deadline: Duration::from_secs(5),
        }
    }
}

/// Counter snapshot for diagnostics and metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributorStats {
    pub broadcasts: u64,
    pub updates_dropped: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    dropped: AtomicU64,
    evictions: AtomicU64,
}

enum Pump {
    Cancelled,
    StreamEnded,
}

/// Owns the subscriber set and the cached latest compiled rule set.
pub struct ConfigDistributor {
    store: Arc<dyn PolicyStore>,
    config: DistributorConfig,
    subscribers: Arc<RwLock<HashMap<SubscriberId, Arc<SubscriberHandle>>>>,
    current: ArcSwapOption<CompiledRuleSet>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    accepting: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigDistributor {
    pub fn new(store: Arc<dyn PolicyStore>, config: DistributorConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            current: ArcSwapOption::empty(),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            worker: Mutex::new(None),
        })
    }

    /// Compiles the initial snapshot and spawns the watch loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(StoreError::Internal(
                "distributor already started".to_string(),
            ));
        }

        // Baseline snapshot so subscribers joining before the first mutation
        // still receive a well-defined view.
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "initial rule-set compile failed");
        }

        *worker = Some(tokio::spawn(Arc::clone(self).run()));
        Ok(())
    }

    /// The cached latest compiled rule set; wait-free.
    pub fn current(&self) -> Option<Arc<CompiledRuleSet>> {
        self.current.load_full()
    }

    /// Adds a subscriber and immediately enqueues the current snapshot as
    /// its baseline.
    pub async fn register(&self) -> Result<Subscription, DistributorError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(DistributorError::ShuttingDown);
        }

        let (handle, subscription) = SubscriberHandle::new(self.config.subscriber_buffer);
        if let Some(snapshot) = self.current() {
            // The channel is fresh; this cannot fail.
            let _ = handle.tx.try_send(snapshot);
        }

        self.subscribers
            .write()
            .await
            .insert(handle.id, Arc::clone(&handle));

        // A concurrent stop may have drained the set between the accepting
        // check and the insert.
        if self.cancel.is_cancelled() {
            self.subscribers.write().await.remove(&handle.id);
            handle.closed.cancel();
            return Err(DistributorError::ShuttingDown);
        }

        tracing::debug!(subscriber = %handle.id, "subscriber registered");
        Ok(subscription)
    }

    /// Removes a subscriber and closes its channels; subsequent enqueues
    /// silently drop.
    pub async fn unregister(&self, id: SubscriberId) {
        if let Some(handle) = self.subscribers.write().await.remove(&id) {
            handle.closed.cancel();
            tracing::debug!(subscriber = %id, "subscriber unregistered");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            updates_dropped: self.counters.dropped.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Stops the background loop and closes every subscriber. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::Release);
        self.cancel.cancel();

        if let Some(mut worker) = self.worker.lock().await.take() {
            tokio::select! {
                _ = &mut worker => {}
                _ = tokio::time::sleep(STOP_GRACE) => {
                    tracing::warn!("distributor loop exceeded stop grace period, aborting");
                    worker.abort();
                }
            }
        }

        let drained: Vec<Arc<SubscriberHandle>> = self
            .subscribers
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in drained {
            handle.closed.cancel();
        }
    }

    /// Background loop: watch, recompile, broadcast. Panics inside one
    /// iteration are caught, the watch is re-established, and the loop
    /// resumes; a malformed policy must never take the process down.
    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let stream = match self.store.watch(self.cancel.child_token()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "store watch failed, retrying");
                    if self.wait_retry().await {
                        break;
                    }
                    continue;
                }
            };

            match AssertUnwindSafe(self.pump(stream)).catch_unwind().await {
                Ok(Pump::Cancelled) => break,
                Ok(Pump::StreamEnded) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!("store watch stream ended, re-establishing");
                    if self.wait_retry().await {
                        break;
                    }
                }
                Err(panic) => {
                    tracing::error!(?panic, "distribution loop panicked, re-establishing watch");
                }
            }
        }
        tracing::debug!("distributor loop stopped");
    }

    async fn pump(&self, mut stream: WatchStream) -> Pump {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Pump::Cancelled,
                event = stream.next() => match event {
                    Some(event) => {
                        tracing::debug!(policy = ?event.policy_name(), "change event received");
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "recompile failed, keeping last good snapshot");
                        }
                    }
                    None => return Pump::StreamEnded,
                }
            }
        }
    }

    /// One consistent read of the store, compiled and broadcast. A snapshot
    /// that fails validation, or whose version equals the cached one, never
    /// replaces the cache.
    async fn refresh(&self) -> Result<(), StoreError> {
        let policies = self.store.list().await?;
        let compiled = compile(&policies);

        if let Err(e) = validate_compiled(&compiled) {
            tracing::error!(error = %e, "compiled rule set invalid, retaining previous snapshot");
            return Ok(());
        }

        let unchanged = self
            .current
            .load()
            .as_ref()
            .map(|cached| cached.version == compiled.version)
            .unwrap_or(false);
        if unchanged {
            tracing::trace!(version = %compiled.version, "rule set unchanged, skipping broadcast");
            return Ok(());
        }

        let snapshot = Arc::new(compiled);
        self.current.store(Some(Arc::clone(&snapshot)));
        tracing::info!(
            version = %snapshot.version,
            rules = snapshot.rules.len(),
            "broadcasting compiled rule set"
        );
        self.broadcast(snapshot).await;
        Ok(())
    }

    /// Concurrent fan-out. The subscriber set is snapshotted under the read
    /// lock and the lock released before any send, so unregister cannot
    /// stall mid-broadcast. Sends never block on a single consumer.
    async fn broadcast(&self, snapshot: Arc<CompiledRuleSet>) {
        let targets: Vec<Arc<SubscriberHandle>> = {
            let subscribers = self.subscribers.read().await;
            subscribers.values().cloned().collect()
        };
        if targets.is_empty() {
            return;
        }
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut sends = JoinSet::new();
        for handle in targets {
            let snapshot = Arc::clone(&snapshot);
            let subscribers = Arc::clone(&self.subscribers);
            let counters = Arc::clone(&self.counters);
            let max_misses = self.config.max_consecutive_misses;

            sends.spawn(async move {
                match handle.tx.try_send(snapshot) {
                    Ok(()) => handle.reset_misses(),
                    Err(TrySendError::Closed(_)) => {
                        if subscribers.write().await.remove(&handle.id).is_some() {
                            handle.closed.cancel();
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        let misses = handle.record_miss();
                        tracing::warn!(
                            subscriber = %handle.id,
                            misses,
                            "subscriber buffer full, dropping update"
                        );
                        if misses >= max_misses {
                            tracing::warn!(subscriber = %handle.id, "evicting slow subscriber");
                            counters.evictions.fetch_add(1, Ordering::Relaxed);
                            if subscribers.write().await.remove(&handle.id).is_some() {
                                handle.closed.cancel();
                            }
                        }
                    }
                }
            });
        }

        // Bound the whole fan-out; an unreachable subscriber cannot hold the
        // loop past the send deadline.
        let drain = async {
            while sends.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.send_deadline, drain).await.is_err() {
            tracing::warn!("broadcast exceeded send deadline");
        }
    }

    /// Returns true when shutdown interrupted the retry delay.
    async fn wait_retry(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_policy::{
        AbortFault, Fault, FaultInjectionPolicy, Metadata, PolicySpec, Rule, RuleMatch,
        StringMatch,
    };
    use faultline_store::MemoryPolicyStore;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn policy(name: &str, status: u16) -> FaultInjectionPolicy {
        FaultInjectionPolicy {
            metadata: Metadata {
                name: name.to_string(),
                version: None,
            },
            spec: PolicySpec {
                rules: vec![Rule {
                    matcher: RuleMatch {
                        method: None,
                        path: Some(StringMatch::Exact("/x".to_string())),
                        headers: Vec::new(),
                    },
                    fault: Fault {
                        percentage: 50,
                        abort: Some(AbortFault {
                            http_status: status,
                            body: None,
                            headers: None,
                        }),
                        delay: None,
                    },
                }],
                start_delay_ms: 0,
                duration_seconds: 0,
            },
        }
    }

    async fn started(config: DistributorConfig) -> (Arc<MemoryPolicyStore>, Arc<ConfigDistributor>) {
        let store = Arc::new(MemoryPolicyStore::new(None));
        let distributor =
            ConfigDistributor::new(store.clone() as Arc<dyn PolicyStore>, config);
        distributor.start().await.unwrap();
        (store, distributor)
    }

    async fn recv(subscription: &mut Subscription) -> Arc<CompiledRuleSet> {
        tokio::time::timeout(RECV_TIMEOUT, subscription.rx.recv())
            .await
            .expect("timed out waiting for snapshot")
            .expect("subscription closed unexpectedly")
    }

    #[tokio::test]
    async fn test_register_enqueues_baseline_snapshot() {
        let (_store, distributor) = started(DistributorConfig::default()).await;

        let mut subscription = distributor.register().await.unwrap();
        let baseline = recv(&mut subscription).await;
        assert!(baseline.rules.is_empty());
        assert_eq!(
            baseline.version,
            distributor.current().unwrap().version
        );

        distributor.stop().await;
    }

    #[tokio::test]
    async fn test_mutation_reaches_subscriber() {
        let (store, distributor) = started(DistributorConfig::default()).await;
        let mut subscription = distributor.register().await.unwrap();
        let _baseline = recv(&mut subscription).await;

        store.create(policy("p1", 503)).await.unwrap();

        let update = recv(&mut subscription).await;
        assert_eq!(update.rules.len(), 1);
        assert_eq!(update.rules[0].policy, "p1");
        assert_eq!(
            update.rules[0].fault.abort.as_ref().unwrap().http_status,
            503
        );

        distributor.stop().await;
    }

    #[tokio::test]
    async fn test_identical_upsert_does_not_rebroadcast() {
        let (store, distributor) = started(DistributorConfig::default()).await;
        let mut subscription = distributor.register().await.unwrap();
        let _baseline = recv(&mut subscription).await;

        store.create_or_update(policy("p1", 503)).await.unwrap();
        let first = recv(&mut subscription).await;

        // Same content compiles to the same version; the distributor
        // suppresses the redundant broadcast.
        store.create_or_update(policy("p1", 503)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let nothing =
            tokio::time::timeout(Duration::from_millis(200), subscription.rx.recv()).await;
        assert!(nothing.is_err(), "expected no duplicate broadcast");
        assert_eq!(distributor.current().unwrap().version, first.version);

        distributor.stop().await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted_and_others_converge() {
        let config = DistributorConfig {
            subscriber_buffer: 1,
            max_consecutive_misses: 2,
            ..Default::default()
        };
        let (store, distributor) = started(config).await;

        // The stuck subscriber never reads; its buffer holds the baseline.
        let stuck = distributor.register().await.unwrap();

        // The healthy subscriber is drained continuously so its one-slot
        // buffer never fills.
        let mut healthy = distributor.register().await.unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(snapshot) = healthy.rx.recv().await {
                let _ = seen_tx.send(snapshot.version.clone());
            }
        });

        for i in 0..6 {
            store
                .create_or_update(policy(&format!("p{i}"), 503))
                .await
                .unwrap();
        }

        // Eviction closes the done-signal.
        tokio::time::timeout(RECV_TIMEOUT, stuck.closed.cancelled())
            .await
            .expect("slow subscriber was not evicted");
        assert_eq!(distributor.subscriber_count().await, 1);
        assert!(distributor.stats().evictions >= 1);
        assert!(distributor.stats().updates_dropped >= 1);

        // The healthy subscriber still converges on the latest version,
        // possibly with gaps.
        let latest = distributor.current().unwrap().version.clone();
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        let mut seen = String::new();
        while seen != latest && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), seen_rx.recv()).await {
                Ok(Some(version)) => seen = version,
                _ => break,
            }
        }
        assert_eq!(seen, latest);

        distributor.stop().await;
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_releases_subscriber() {
        let (_store, distributor) = started(DistributorConfig::default()).await;

        let subscription = distributor.register().await.unwrap();
        assert_eq!(distributor.subscriber_count().await, 1);

        distributor.unregister(subscription.id).await;
        assert_eq!(distributor.subscriber_count().await, 0);
        assert!(subscription.closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_registrations() {
        let (_store, distributor) = started(DistributorConfig::default()).await;
        let mut subscription = distributor.register().await.unwrap();
        let _baseline = recv(&mut subscription).await;

        distributor.stop().await;
        distributor.stop().await;

        assert!(matches!(
            distributor.register().await,
            Err(DistributorError::ShuttingDown)
        ));
        // The open subscription ends from the server side.
        assert!(subscription.closed.is_cancelled());
        let next = tokio::time::timeout(RECV_TIMEOUT, subscription.rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_current_reflects_latest_committed_state() {
        let (store, distributor) = started(DistributorConfig::default()).await;

        store.create(policy("p1", 503)).await.unwrap();
        store.create_or_update(policy("p1", 599)).await.unwrap();

        // Wait until the background loop catches up.
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some(current) = distributor.current() {
                if current.rules.len() == 1
                    && current.rules[0].fault.abort.as_ref().unwrap().http_status == 599
                {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "distributor never converged"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        distributor.stop().await;
    }
}
