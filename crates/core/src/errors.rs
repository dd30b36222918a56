//! Error taxonomy shared across the sync core.

use thiserror::Error;

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the sync core and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller mistake caught before any write. Never queued or retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Owner mismatch on a mutating call. Never queued or retried.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Referenced document is missing.
    #[error("{collection} record '{id}' not found")]
    NotFound { collection: String, id: String },

    /// Transient remote failure (network, index-not-ready, backend down).
    /// Default policy is queue-and-retry.
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// Optimistic-concurrency precondition failed during a commit.
    #[error("Commit conflict: {0}")]
    Conflict(String),

    /// Local durable store unavailable. Propagated loudly, never swallowed.
    #[error("Queue storage error: {0}")]
    QueueStorage(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside the core itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a permission-denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Create a not-found error
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Create a transient remote error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// True when the failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }

    /// True when a failed facade mutation should be persisted to the local
    /// queue for replay. Caller mistakes are returned, not queued.
    pub fn is_queueable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::PermissionDenied(_) => false,
            Self::QueueStorage(_) => false,
            _ => true,
        }
    }

    /// True when the queue processor should stop retrying a record carrying
    /// this error and route it to the abandonment path.
    pub fn is_terminal_for_replay(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::PermissionDenied(_) | Self::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_queueable() {
        assert!(!Error::validation("amount must be positive").is_queueable());
        assert!(!Error::permission_denied("owner mismatch").is_queueable());
        assert!(Error::transient("socket closed").is_queueable());
    }

    #[test]
    fn not_found_is_terminal_but_queueable() {
        let err = Error::not_found("transactions", "tx-1");
        assert!(err.is_queueable());
        assert!(err.is_terminal_for_replay());
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflict_is_retryable() {
        assert!(Error::Conflict("account version moved".to_string()).is_retryable());
    }
}
