//! Store error taxonomy. A closed set of kinds; the HTTP surface maps each
//! kind onto a status code, and stringification happens only there.

use faultline_policy::ValidationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by any [`crate::PolicyStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("policy '{0}' already exists")]
    AlreadyExists(String),

    #[error("policy '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("policy limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// True for transient conditions a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
