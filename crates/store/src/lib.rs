//! # Policy Store
//!
//! Persistence for fault-injection policies behind one backend-agnostic
//! contract:
//! - strict create/update plus idempotent upsert
//! - copy-on-read Get/List (callers may mutate what they receive)
//! - a watch stream of change events, delivered in commit order
//! - two backends: ephemeral in-process and replicated etcd
//! - the expiration registry that auto-removes time-bounded policies

pub mod error;
pub mod event;
pub mod expiry;
pub mod kv;
pub mod memory;

use async_trait::async_trait;
use faultline_policy::FaultInjectionPolicy;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub use error::{Result, StoreError};
pub use event::ChangeEvent;
pub use expiry::ExpirationRegistry;
pub use kv::EtcdPolicyStore;
pub use memory::MemoryPolicyStore;

/// Buffer size of each watch channel. A watcher that falls this far behind
/// has events dropped rather than stalling writers.
pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// What an upsert did, so the HTTP surface can answer 201 vs 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

/// A long-lived stream of change events; ends when the caller's
/// cancellation token fires or the store closes.
pub type WatchStream = ReceiverStream<ChangeEvent>;

/// Backend-agnostic policy persistence.
///
/// All operations are safe for concurrent callers. Every successful
/// mutation produces exactly one [`ChangeEvent`] on each live watch stream,
/// in the order the mutations were committed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Strict create; fails with [`StoreError::AlreadyExists`] on a taken name.
    async fn create(&self, policy: FaultInjectionPolicy) -> Result<()>;

    /// Strict update; fails with [`StoreError::NotFound`] on an unknown name.
    async fn update(&self, policy: FaultInjectionPolicy) -> Result<()>;

    /// Idempotent upsert, preferred by operator tooling.
    async fn create_or_update(&self, policy: FaultInjectionPolicy) -> Result<Applied>;

    /// Fetches one policy. The returned value is a deep copy.
    async fn get(&self, name: &str) -> Result<FaultInjectionPolicy>;

    /// Snapshot of all policies. Returned values are deep copies; mutating
    /// them cannot corrupt store state.
    async fn list(&self) -> Result<Vec<FaultInjectionPolicy>>;

    /// Removes one policy.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Opens a change-event stream. One stream per call; closes when
    /// `cancel` fires.
    async fn watch(&self, cancel: CancellationToken) -> Result<WatchStream>;

    /// Disconnects cleanly. Subsequent operations fail; open watch streams
    /// end.
    async fn close(&self);
}
