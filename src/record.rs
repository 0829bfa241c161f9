//! Persisted record and metadata wire types.
//!
//! A store entry is a pair of documents: the payload record
//! `{"k": <key>, "v": <value>, "e": <expiry-epoch-ms-or-null>}` and the
//! conflict-detection metadata `{"setTime": <epoch-ms>, "key": <key>}`.
//! The two are always written and deleted together by the flusher, though
//! they may observably diverge mid-flight in remote storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The external representation of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Cache key
    #[serde(rename = "k")]
    pub key: String,
    /// Cached value
    #[serde(rename = "v")]
    pub value: Value,
    /// Absolute expiry as epoch milliseconds, `null` for unbounded
    #[serde(rename = "e")]
    pub expires_at: Option<i64>,
}

impl Record {
    /// Create a new record.
    pub fn new(key: impl Into<String>, value: Value, expires_at: Option<i64>) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at,
        }
    }

    /// Whether the record has expired at the given time.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now_ms)
    }
}

/// The conflict-detection signal for a persisted record.
///
/// Metadata outlives the record on deletion (a tombstone keeps the key and
/// the deletion timestamp) so that other cache instances can distinguish
/// "deleted" from "never existed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Logical timestamp of the last mutation, epoch milliseconds
    #[serde(rename = "setTime")]
    pub set_time: i64,
    /// Cache key (recoverable from metadata alone)
    pub key: String,
}

impl Metadata {
    /// Create new metadata.
    pub fn new(key: impl Into<String>, set_time: i64) -> Self {
        Self {
            set_time,
            key: key.into(),
        }
    }
}
