//! Error types for the cache engine and its backing stores.

use thiserror::Error;

/// Errors raised by store backends.
///
/// These carry the underlying cause (I/O, serialization) and are converted
/// into [`CacheError`] at the engine boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error during store operations
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted record could not be serialized or deserialized
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted record failed structural validation
    #[error("malformed record for key `{key}`")]
    MalformedRecord { key: String },

    /// Backend-specific transport failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Engine-level errors.
///
/// `CacheError` is `Clone` because in-flight diff/sync/fetch results are
/// shared between concurrent callers of the same key; the causing error is
/// rendered into the message rather than carried by reference.
///
/// Reads never fail for absence: a missing value is `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A backing store operation failed (no retry is applied at this layer)
    #[error("store operation failed: {0}")]
    Store(String),

    /// A persisted record failed structural validation
    #[error("malformed persisted record for key `{key}`")]
    MalformedRecord { key: String },

    /// A `wrap` fetcher failed and no fallback value was available
    #[error("fetcher failed for key `{key}`: {message}")]
    FetchFailed { key: String, message: String },
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MalformedRecord { key } => CacheError::MalformedRecord { key },
            other => CacheError::Store(other.to_string()),
        }
    }
}
