//! Error types for the sqlite storage crate.

use thiserror::Error;

/// Failures inside the local durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database query error
    #[error("Database query error: {0}")]
    Query(#[from] diesel::result::Error),

    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Every storage failure surfaces as a loud queue-storage error: losing a
/// queued mutation is worse than surfacing the failure.
impl From<StorageError> for fintrack_core::Error {
    fn from(err: StorageError) -> Self {
        fintrack_core::Error::QueueStorage(err.to_string())
    }
}
