//! Ephemeral in-process backend.
//!
//! A name→policy map under a reader-writer lock. Values are computed and
//! validated before the writer side is taken, so the critical section only
//! swaps map entries and fans the change event out. Watch fan-out uses a
//! non-blocking send per watcher: the mutation always succeeds, a full
//! watcher buffer drops the event for that watcher only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use faultline_policy::{validate_policy, FaultInjectionPolicy};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::event::ChangeEvent;
use crate::{Applied, PolicyStore, WatchStream, WATCH_CHANNEL_CAPACITY};

struct Watcher {
    id: u64,
    tx: mpsc::Sender<ChangeEvent>,
}

/// In-process [`PolicyStore`] for single-instance deployments and tests.
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<String, FaultInjectionPolicy>>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    next_watcher_id: AtomicU64,
    max_policies: Option<usize>,
    closed: AtomicBool,
}

impl MemoryPolicyStore {
    /// Creates an empty store. `max_policies` caps strict creates; `None`
    /// means unlimited.
    pub fn new(max_policies: Option<usize>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watcher_id: AtomicU64::new(0),
            max_policies,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("store is closed".to_string()));
        }
        Ok(())
    }

    fn check_capacity(&self, current: usize) -> Result<()> {
        match self.max_policies {
            Some(cap) if current >= cap => Err(StoreError::CapacityExceeded(cap)),
            _ => Ok(()),
        }
    }

    /// Fans one event out to every live watcher. Called while the writer
    /// lock is held so events leave in commit order.
    async fn publish(&self, event: ChangeEvent) {
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|watcher| match watcher.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    watcher = watcher.id,
                    event = ?event.policy_name(),
                    "watch buffer full, dropping change event for slow watcher"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn create(&self, policy: FaultInjectionPolicy) -> Result<()> {
        self.ensure_open()?;
        validate_policy(&policy)?;

        let mut policies = self.policies.write().await;
        if policies.contains_key(policy.name()) {
            return Err(StoreError::AlreadyExists(policy.name().to_string()));
        }
        self.check_capacity(policies.len())?;

        policies.insert(policy.name().to_string(), policy.clone());
        self.publish(ChangeEvent::Created(policy)).await;
        Ok(())
    }

    async fn update(&self, policy: FaultInjectionPolicy) -> Result<()> {
        self.ensure_open()?;
        validate_policy(&policy)?;

        let mut policies = self.policies.write().await;
        if !policies.contains_key(policy.name()) {
            return Err(StoreError::NotFound(policy.name().to_string()));
        }

        policies.insert(policy.name().to_string(), policy.clone());
        self.publish(ChangeEvent::Updated(policy)).await;
        Ok(())
    }

    async fn create_or_update(&self, policy: FaultInjectionPolicy) -> Result<Applied> {
        self.ensure_open()?;
        validate_policy(&policy)?;

        let mut policies = self.policies.write().await;
        let applied = if policies.contains_key(policy.name()) {
            Applied::Updated
        } else {
            self.check_capacity(policies.len())?;
            Applied::Created
        };

        policies.insert(policy.name().to_string(), policy.clone());
        let event = match applied {
            Applied::Created => ChangeEvent::Created(policy),
            Applied::Updated => ChangeEvent::Updated(policy),
        };
        self.publish(event).await;
        Ok(applied)
    }

    async fn get(&self, name: &str) -> Result<FaultInjectionPolicy> {
        self.ensure_open()?;
        self.policies
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<FaultInjectionPolicy>> {
        self.ensure_open()?;
        Ok(self.policies.read().await.values().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;

        let mut policies = self.policies.write().await;
        if policies.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.publish(ChangeEvent::Deleted(name.to_string())).await;
        Ok(())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().await.push(Watcher { id, tx });

        // Dropping the sender ends the stream once the token fires.
        let watchers = Arc::clone(&self.watchers);
        tokio::spawn(async move {
            cancel.cancelled().await;
            watchers.lock().await.retain(|watcher| watcher.id != id);
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.watchers.lock().await.clear();
    }
}
