//! Epoch-millisecond clock helpers.
//!
//! All timestamps in the cache (entry expiry, SetTime metadata) are
//! milliseconds since the Unix epoch, matching the persisted record format.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Absolute expiry timestamp for a TTL starting now.
pub fn expiry_after(ttl: Duration) -> i64 {
    epoch_ms() + ttl.as_millis() as i64
}
