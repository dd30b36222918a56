//! Error types for the remote store client.

use thiserror::Error;

/// Result type alias for remote store operations.
pub type Result<T> = std::result::Result<T, RemoteStoreError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors that can occur while talking to the document-database API.
#[derive(Debug, Error)]
pub enum RemoteStoreError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteStoreError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

/// Map an API failure into the core taxonomy: precondition failures are
/// conflicts, 4xx validation is a caller mistake, auth problems are
/// permission failures, and anything retryable is transient.
impl From<RemoteStoreError> for fintrack_core::Error {
    fn from(err: RemoteStoreError) -> Self {
        use fintrack_core::Error as CoreError;
        if let RemoteStoreError::Api { status, message } = &err {
            match *status {
                400 | 422 => return CoreError::Validation(message.clone()),
                409 => return CoreError::Conflict(message.clone()),
                _ => {}
            }
        }
        match err.retry_class() {
            ApiRetryClass::Retryable => CoreError::Transient(err.to_string()),
            ApiRetryClass::ReauthRequired => CoreError::PermissionDenied(err.to_string()),
            ApiRetryClass::Permanent => CoreError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = RemoteStoreError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), ApiRetryClass::ReauthRequired);
    }

    #[test]
    fn server_errors_are_retryable() {
        assert_eq!(
            RemoteStoreError::api(503, "unavailable").retry_class(),
            ApiRetryClass::Retryable
        );
    }

    #[test]
    fn version_precondition_failure_maps_to_conflict() {
        let core: fintrack_core::Error = RemoteStoreError::api(409, "version moved").into();
        assert!(matches!(core, fintrack_core::Error::Conflict(_)));
        assert!(core.is_retryable());
    }

    #[test]
    fn bad_request_maps_to_validation() {
        let core: fintrack_core::Error = RemoteStoreError::api(400, "amount missing").into();
        assert!(matches!(core, fintrack_core::Error::Validation(_)));
        assert!(!core.is_queueable());
    }

    #[test]
    fn transport_failures_map_to_transient() {
        let core: fintrack_core::Error =
            RemoteStoreError::invalid_request("missing base url").into();
        assert!(matches!(core, fintrack_core::Error::Internal(_)));
        let core: fintrack_core::Error = RemoteStoreError::api(502, "bad gateway").into();
        assert!(matches!(core, fintrack_core::Error::Transient(_)));
    }
}
