//! Error type shared by every store operation.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// All the ways a store operation can fail.
///
/// Lifecycle invalidation is not an error: it shows up as the readiness
/// signal dropping back to closed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The readiness wait timed out or the store has been shut down.
    /// The operation was never attempted.
    #[error("store not ready: {0}")]
    NotReady(String),

    /// An update targeted an id with no stored record.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The engine rejected a request (quota, corruption, disallowed operation).
    #[error("storage error: {0}")]
    Storage(#[source] BoxError),

    /// The enclosing transaction aborted after its requests were queued.
    #[error("transaction aborted: {0}")]
    Transaction(#[source] BoxError),
}

impl StoreError {
    pub fn storage(err: impl Into<BoxError>) -> Self {
        StoreError::Storage(err.into())
    }

    pub fn transaction(err: impl Into<BoxError>) -> Self {
        StoreError::Transaction(err.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(Box::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Storage(Box::new(err))
    }
}
