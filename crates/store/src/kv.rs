//! Replicated key-value backend on etcd.
//!
//! One key per policy under `<prefix>policies/`, value is the canonical JSON
//! serialization. Strict create/update are etcd transactions comparing the
//! key's create revision, so concurrent writers on different replicas cannot
//! race past each other. Watch translates the native prefix watch into
//! [`ChangeEvent`]s; on disconnect it reconnects with capped exponential
//! backoff and synthesizes a [`ChangeEvent::Rebuilt`] so downstream state
//! resyncs from a fresh list.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, Event, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use faultline_policy::{validate_policy, FaultInjectionPolicy};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::event::ChangeEvent;
use crate::{Applied, PolicyStore, WatchStream, WATCH_CHANNEL_CAPACITY};

const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// etcd-backed [`PolicyStore`] for replicated deployments.
pub struct EtcdPolicyStore {
    client: Client,
    prefix: String,
    max_policies: Option<usize>,
    /// Parent of every watch task; fired by `close`.
    shutdown: CancellationToken,
}

impl EtcdPolicyStore {
    /// Connects to the given endpoints. `prefix` namespaces all keys, e.g.
    /// `faultline/`.
    pub async fn connect(
        endpoints: &[String],
        prefix: impl Into<String>,
        max_policies: Option<usize>,
    ) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.into(),
            max_policies,
            shutdown: CancellationToken::new(),
        })
    }

    fn key_prefix(&self) -> String {
        format!("{}policies/", self.prefix)
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix(), name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(StoreError::Unavailable("store is closed".to_string()));
        }
        Ok(())
    }

    async fn stored_count(&self) -> Result<usize> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(
                self.key_prefix(),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await
            .map_err(from_etcd)?;
        Ok(resp.count().max(0) as usize)
    }

    async fn check_capacity(&self) -> Result<()> {
        if let Some(cap) = self.max_policies {
            if self.stored_count().await? >= cap {
                return Err(StoreError::CapacityExceeded(cap));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for EtcdPolicyStore {
    async fn create(&self, policy: FaultInjectionPolicy) -> Result<()> {
        self.ensure_open()?;
        validate_policy(&policy)?;
        self.check_capacity().await?;

        let key = self.key_for(policy.name());
        let value = encode(&policy)?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let resp = self.client.kv_client().txn(txn).await.map_err(from_etcd)?;
        if !resp.succeeded() {
            return Err(StoreError::AlreadyExists(policy.name().to_string()));
        }
        Ok(())
    }

    async fn update(&self, policy: FaultInjectionPolicy) -> Result<()> {
        self.ensure_open()?;
        validate_policy(&policy)?;

        let key = self.key_for(policy.name());
        let value = encode(&policy)?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Greater,
                0,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let resp = self.client.kv_client().txn(txn).await.map_err(from_etcd)?;
        if !resp.succeeded() {
            return Err(StoreError::NotFound(policy.name().to_string()));
        }
        Ok(())
    }

    async fn create_or_update(&self, policy: FaultInjectionPolicy) -> Result<Applied> {
        self.ensure_open()?;
        validate_policy(&policy)?;

        let key = self.key_for(policy.name());
        let value = encode(&policy)?;

        // The capacity check only binds when the upsert would create.
        if self.max_policies.is_some() && self.get(policy.name()).await.is_err() {
            self.check_capacity().await?;
        }

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key.clone(), value.clone(), None)])
            .or_else(vec![TxnOp::put(key, value, None)]);

        let resp = self.client.kv_client().txn(txn).await.map_err(from_etcd)?;
        if resp.succeeded() {
            Ok(Applied::Created)
        } else {
            Ok(Applied::Updated)
        }
    }

    async fn get(&self, name: &str) -> Result<FaultInjectionPolicy> {
        self.ensure_open()?;

        let mut kv = self.client.kv_client();
        let resp = kv.get(self.key_for(name), None).await.map_err(from_etcd)?;
        match resp.kvs().first() {
            Some(entry) => decode(entry.value()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<FaultInjectionPolicy>> {
        self.ensure_open()?;

        let mut kv = self.client.kv_client();
        let resp = kv
            .get(self.key_prefix(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(from_etcd)?;

        let mut policies = Vec::with_capacity(resp.kvs().len());
        for entry in resp.kvs() {
            match decode(entry.value()) {
                Ok(policy) => policies.push(policy),
                // One malformed record must not take the whole view down.
                Err(e) => tracing::warn!(
                    key = %String::from_utf8_lossy(entry.key()),
                    error = %e,
                    "skipping malformed policy record"
                ),
            }
        }
        Ok(policies)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;

        let mut kv = self.client.kv_client();
        let resp = kv
            .delete(self.key_for(name), None)
            .await
            .map_err(from_etcd)?;
        if resp.deleted() == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let prefix = self.key_prefix();
        let stop = self.shutdown.child_token();

        tokio::spawn(run_watch(client, prefix, tx, cancel, stop));
        Ok(ReceiverStream::new(rx))
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Long-lived watch task: translate native events, reconnect with capped
/// backoff on any failure, and mark each reconnect with `Rebuilt`.
async fn run_watch(
    client: Client,
    prefix: String,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut backoff = INITIAL_RECONNECT_BACKOFF;
    let mut reconnected = false;

    'reconnect: loop {
        if cancel.is_cancelled() || stop.is_cancelled() {
            return;
        }

        let mut watch_client = client.watch_client();
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (mut watcher, mut stream) =
            match watch_client.watch(prefix.clone(), Some(options)).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?backoff, "policy watch failed, retrying");
                    if sleep_or_stopped(backoff, &cancel, &stop).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                    continue;
                }
            };

        if reconnected {
            tracing::info!("policy watch re-established, forcing resync");
            forward(&tx, ChangeEvent::Rebuilt);
        }
        reconnected = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return;
                }
                _ = stop.cancelled() => {
                    let _ = watcher.cancel().await;
                    return;
                }
                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        backoff = INITIAL_RECONNECT_BACKOFF;
                        for event in resp.events() {
                            if let Some(change) = translate(event, &prefix) {
                                forward(&tx, change);
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("policy watch stream ended, reconnecting");
                        continue 'reconnect;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "policy watch stream error, reconnecting");
                        if sleep_or_stopped(backoff, &cancel, &stop).await {
                            return;
                        }
                        backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

/// Non-blocking forward, mirroring the in-process backend: a full consumer
/// buffer drops the event rather than stalling the watch.
fn forward(tx: &mpsc::Sender<ChangeEvent>, event: ChangeEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        tracing::warn!(
            event = ?event.policy_name(),
            "watch buffer full, dropping change event for slow watcher"
        );
    }
}

/// Maps one native etcd event onto the internal change-event shape.
fn translate(event: &Event, prefix: &str) -> Option<ChangeEvent> {
    let kv = event.kv()?;
    let name = policy_name_from_key(prefix, kv.key())?;

    match event.event_type() {
        EventType::Put => {
            let policy = match decode(kv.value()) {
                Ok(policy) => policy,
                Err(e) => {
                    tracing::warn!(policy = %name, error = %e, "ignoring malformed policy event");
                    return None;
                }
            };
            if event.prev_kv().is_some() {
                Some(ChangeEvent::Updated(policy))
            } else {
                Some(ChangeEvent::Created(policy))
            }
        }
        EventType::Delete => Some(ChangeEvent::Deleted(name)),
    }
}

fn policy_name_from_key(prefix: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let name = key.strip_prefix(prefix)?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Returns true when the sleep was interrupted by shutdown.
async fn sleep_or_stopped(
    duration: Duration,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn encode(policy: &FaultInjectionPolicy) -> Result<Vec<u8>> {
    serde_json::to_vec(policy).map_err(|e| StoreError::Internal(e.to_string()))
}

fn decode(value: &[u8]) -> Result<FaultInjectionPolicy> {
    serde_json::from_slice(value)
        .map_err(|e| StoreError::Internal(format!("malformed policy record: {e}")))
}

fn from_etcd(err: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}
