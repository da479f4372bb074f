//! # Config Distributor
//!
//! Fans the compiled rule set out to a dynamic population of long-lived
//! data-plane subscribers:
//! - owns the subscriber set and a wait-free cache of the latest snapshot
//! - watches the store and recompiles the full view on every change event
//! - non-blocking broadcast with drop-then-evict slow-consumer handling
//! - panic-isolated background loop and idempotent shutdown

pub mod distributor;
pub mod subscriber;

pub use distributor::{ConfigDistributor, DistributorConfig, DistributorStats};
pub use subscriber::{SubscriberId, Subscription};

use thiserror::Error;

/// Errors surfaced to the streaming surface.
#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("distributor is shutting down")]
    ShuttingDown,
}
