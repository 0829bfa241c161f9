//! The uniform contract implemented by every backing store.
//!
//! A store persists [`Record`]s alongside their [`Metadata`]. The engine
//! writes and deletes the two together; deletion keeps the metadata as a
//! tombstone (with a bumped `setTime`) so that other cache instances can
//! tell a deleted key apart from one that never existed.
//!
//! At most one store flags itself primary: it is the single authoritative
//! remote the reconciler reads from. Any additional stores act purely as
//! replicas of the persisted state and never serve reconciliation reads.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;
use crate::record::{Metadata, Record};

/// Boxed future type used by the dyn-compatible store trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability set of a backing store.
///
/// Implementations copy borrowed arguments before entering their async
/// bodies, so every returned future borrows only the store itself.
///
/// Timeouts and retries, if any, belong inside implementations of this
/// trait; the engine runs every store call to completion or failure.
pub trait Store: Send + Sync {
    /// Whether this store is the authoritative remote for reconciliation.
    fn is_primary(&self) -> bool {
        false
    }

    /// True iff a live record exists for the key (tombstones excluded).
    fn has(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Fetch the full record for a key, `None` when absent or tombstoned.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Record>, StoreError>>;

    /// Batched [`Store::get`], preserving input order.
    fn mget(&self, keys: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<Record>>, StoreError>>;

    /// Write a record together with its metadata.
    fn set(&self, record: Record, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Batched [`Store::set`]; `set_times` is parallel to `records`.
    fn mset(
        &self,
        records: Vec<Record>,
        set_times: Vec<i64>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Tombstone a key: the record is removed, the metadata survives with
    /// the deletion timestamp.
    fn del(&self, key: &str, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Batched [`Store::del`]; `set_times` is parallel to `keys`.
    fn mdel(&self, keys: Vec<String>, set_times: Vec<i64>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Live keys, glob-filtered when a pattern is given. Tombstoned-only
    /// metadata is excluded.
    fn keys(&self, pattern: Option<&str>) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// All live records. Malformed persisted entries are purged from the
    /// store and filtered from the result.
    fn values(&self) -> BoxFuture<'_, Result<Vec<Record>, StoreError>>;

    /// Raw metadata access, including tombstones.
    fn get_metadata(&self, key: &str) -> BoxFuture<'_, Result<Option<Metadata>, StoreError>>;

    /// Overwrite the metadata for a key.
    fn set_metadata(&self, key: &str, metadata: Metadata)
        -> BoxFuture<'_, Result<(), StoreError>>;

    /// Compare the store's recorded set-time against a local one.
    ///
    /// Returns `None` when the store holds no record of the key at all
    /// (not even a tombstone); otherwise `Some(true)` iff the store's
    /// set-time is strictly newer than `set_time`, with an absent local
    /// `set_time` counting any stored record as newer.
    fn check_if_has_newer(
        &self,
        key: &str,
        set_time: Option<i64>,
    ) -> BoxFuture<'_, Result<Option<bool>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            let metadata = self.get_metadata(&key).await?;
            Ok(metadata.map(|meta| match set_time {
                Some(local) => meta.set_time > local,
                None => true,
            }))
        })
    }
}
