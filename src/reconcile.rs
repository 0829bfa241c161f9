//! Reconciliation of the in-memory tiers against the primary store.
//!
//! Multiple cache instances share one authoritative remote. Before an
//! instance trusts its local copy of a key it diffs the key against the
//! primary's metadata, classifying the remote state as one of:
//!
//! - `Deleted`: the remote holds a tombstone newer than our copy
//! - `Changed`: the remote holds a record newer than our copy
//! - `Unchanged`: our copy is as new as the remote's
//! - `Missing`: the remote has never seen the key
//!
//! Syncing then folds that state back into the tiers. Both the diff and
//! the sync are deduplicated per key: concurrent callers share one
//! in-flight future instead of issuing redundant store reads.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::flush::Flusher;
use crate::store::{BoxFuture, Store};
use crate::tier::Tiers;
use crate::time::epoch_ms;

/// Classification of a key's state in the primary store relative to the
/// local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// A tombstone newer than the local copy
    Deleted,
    /// A record newer than the local copy
    Changed,
    /// The local copy is current
    Unchanged,
    /// No record and no tombstone
    Missing,
}

pub(crate) type DiffHandle = Shared<BoxFuture<'static, Result<RemoteState, CacheError>>>;
pub(crate) type SyncHandle = Shared<BoxFuture<'static, Result<Option<Value>, CacheError>>>;

/// Diffs and syncs keys against the primary store.
///
/// Only constructed when a primary store is configured.
pub(crate) struct Reconciler {
    primary: Arc<dyn Store>,
    tiers: Arc<Tiers>,
    set_times: Arc<DashMap<String, i64>>,
    flusher: Arc<Flusher>,
    diffs: DashMap<String, DiffHandle>,
    syncs: DashMap<String, SyncHandle>,
}

impl Reconciler {
    pub fn new(
        primary: Arc<dyn Store>,
        tiers: Arc<Tiers>,
        set_times: Arc<DashMap<String, i64>>,
        flusher: Arc<Flusher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            primary,
            tiers,
            set_times,
            flusher,
            diffs: DashMap::new(),
            syncs: DashMap::new(),
        })
    }

    /// Classify the primary store's state for `key`, sharing any in-flight
    /// classification for the same key.
    pub fn diff(self: &Arc<Self>, key: &str) -> DiffHandle {
        if let Some(existing) = self.diffs.get(key) {
            return existing.clone();
        }
        let this = Arc::clone(self);
        let owned = key.to_string();
        let fut: BoxFuture<'static, Result<RemoteState, CacheError>> = Box::pin(async move {
            let result = this.compute_diff(&owned).await;
            this.diffs.remove(&owned);
            result
        });
        match self.diffs.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = fut.shared();
                entry.insert(handle.clone());
                handle
            }
        }
    }

    async fn compute_diff(&self, key: &str) -> Result<RemoteState, CacheError> {
        let local = self.set_times.get(key).map(|t| *t);
        let newer = self.primary.check_if_has_newer(key, local).await?;
        let state = match newer {
            None => RemoteState::Missing,
            Some(false) => RemoteState::Unchanged,
            // Newer metadata with no record is a tombstone.
            Some(true) => {
                if self.primary.has(key).await? {
                    RemoteState::Changed
                } else {
                    RemoteState::Deleted
                }
            }
        };
        debug!(key, ?state, "reconciled remote state");
        Ok(state)
    }

    /// Fold a diffed state back into the tiers, resolving to the key's
    /// local value afterwards. Concurrent syncs for one key share a single
    /// in-flight future. A store-transport failure while pulling a changed
    /// record surfaces as the error; the engine decides whether its read
    /// policy tolerates it.
    pub fn sync(self: &Arc<Self>, state: RemoteState, key: &str) -> SyncHandle {
        if let Some(existing) = self.syncs.get(key) {
            return existing.clone();
        }
        let this = Arc::clone(self);
        let owned = key.to_string();
        let fut: BoxFuture<'static, Result<Option<Value>, CacheError>> = Box::pin(async move {
            let value = this.apply_sync(state, &owned).await;
            this.syncs.remove(&owned);
            value
        });
        match self.syncs.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = fut.shared();
                entry.insert(handle.clone());
                handle
            }
        }
    }

    async fn apply_sync(&self, state: RemoteState, key: &str) -> Result<Option<Value>, CacheError> {
        match state {
            RemoteState::Unchanged => Ok(self.tiers.local_get(key)),
            RemoteState::Missing => Ok(None),
            RemoteState::Deleted => {
                debug!(key, "dropping remotely deleted key");
                self.tiers.remove(key);
                self.set_times.remove(key);
                Ok(None)
            }
            RemoteState::Changed => self.pull(key).await,
        }
    }

    /// Pull the newer record from the primary and adopt it locally,
    /// replicating it (under the store's own timestamp, so the key's clock
    /// does not advance) to the remaining stores via the flusher.
    async fn pull(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let record = match self.primary.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Record vanished between diff and pull.
                self.tiers.remove(key);
                self.set_times.remove(key);
                return Ok(None);
            }
            Err(e) => {
                warn!(key, error = %e, "failed to pull changed record");
                return Err(e.into());
            }
        };
        let set_time = match self.primary.get_metadata(key).await {
            Ok(Some(meta)) => meta.set_time,
            _ => epoch_ms(),
        };
        match self.tiers.apply_record(record) {
            Some(value) => {
                debug!(key, "adopted newer remote record");
                let _flush = self.flusher.note_change(vec![key.to_string()], set_time);
                Ok(Some(value))
            }
            None => {
                // Already expired on arrival; remember its timestamp so the
                // next diff reports Unchanged instead of re-pulling.
                self.set_times.insert(key.to_string(), set_time);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::store::testing::CountingStore;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Fixture {
        primary: Arc<MemoryStore>,
        counting: Arc<CountingStore>,
        tiers: Arc<Tiers>,
        set_times: Arc<DashMap<String, i64>>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture() -> Fixture {
        fixture_with_stores(Vec::new())
    }

    fn fixture_with_stores(extra: Vec<Arc<dyn Store>>) -> Fixture {
        let primary = Arc::new(MemoryStore::new().with_primary(true));
        let counting = Arc::new(CountingStore::wrap(primary.clone()));
        let tiers = Arc::new(Tiers::new(1_000_000, 1_000_000, None));
        let set_times = Arc::new(DashMap::new());
        let mut stores: Vec<Arc<dyn Store>> = vec![counting.clone()];
        stores.extend(extra);
        let flusher = Flusher::new(Arc::clone(&tiers), stores, Arc::clone(&set_times));
        let reconciler = Reconciler::new(
            counting.clone(),
            Arc::clone(&tiers),
            Arc::clone(&set_times),
            flusher,
        );
        Fixture {
            primary,
            counting,
            tiers,
            set_times,
            reconciler,
        }
    }

    #[tokio::test]
    async fn diff_reports_missing_for_unknown_keys() {
        let fx = fixture();
        let state = fx.reconciler.diff("foo").await.unwrap();
        assert_eq!(state, RemoteState::Missing);
    }

    #[tokio::test]
    async fn diff_reports_changed_when_store_is_newer() {
        let fx = fixture();
        fx.primary
            .set(Record::new("foo", json!("remote"), None), 200)
            .await
            .unwrap();
        fx.set_times.insert("foo".to_string(), 100);

        assert_eq!(fx.reconciler.diff("foo").await.unwrap(), RemoteState::Changed);
    }

    #[tokio::test]
    async fn diff_reports_unchanged_when_local_is_current() {
        let fx = fixture();
        fx.primary
            .set(Record::new("foo", json!("remote"), None), 200)
            .await
            .unwrap();
        fx.set_times.insert("foo".to_string(), 200);

        assert_eq!(
            fx.reconciler.diff("foo").await.unwrap(),
            RemoteState::Unchanged
        );
    }

    #[tokio::test]
    async fn diff_reports_deleted_for_newer_tombstones() {
        let fx = fixture();
        fx.primary.del("foo", 300).await.unwrap();
        fx.set_times.insert("foo".to_string(), 100);

        assert_eq!(fx.reconciler.diff("foo").await.unwrap(), RemoteState::Deleted);
    }

    #[tokio::test]
    async fn diff_reports_changed_for_keys_never_seen_locally() {
        let fx = fixture();
        fx.primary
            .set(Record::new("foo", json!("remote"), None), 200)
            .await
            .unwrap();

        // No local set time at all: the store's record counts as newer.
        assert_eq!(fx.reconciler.diff("foo").await.unwrap(), RemoteState::Changed);
    }

    #[tokio::test]
    async fn concurrent_diffs_share_one_metadata_read() {
        let fx = fixture();
        let first = fx.reconciler.diff("foo");
        let second = fx.reconciler.diff("foo");

        let (a, b) = futures::join!(first, second);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fx.counting.metadata_reads.load(Ordering::SeqCst), 1);

        // A settled diff is not reused.
        fx.reconciler.diff("foo").await.unwrap();
        assert_eq!(fx.counting.metadata_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sync_deleted_drops_the_key_from_both_tiers() {
        let fx = fixture();
        fx.tiers.write("foo", json!("local"), None);
        fx.set_times.insert("foo".to_string(), 100);

        let value = fx.reconciler.sync(RemoteState::Deleted, "foo").await.unwrap();

        assert_eq!(value, None);
        assert_eq!(fx.tiers.peek_main("foo"), None);
        assert_eq!(fx.tiers.peek_backup("foo"), None);
        assert!(!fx.set_times.contains_key("foo"));
    }

    #[tokio::test]
    async fn sync_changed_adopts_and_replicates_under_store_timestamp() {
        let replica = Arc::new(MemoryStore::new());
        let fx = fixture_with_stores(vec![replica.clone()]);
        fx.primary
            .set(Record::new("foo", json!("remote"), None), 4_200)
            .await
            .unwrap();

        let value = fx.reconciler.sync(RemoteState::Changed, "foo").await.unwrap();
        assert_eq!(value, Some(json!("remote")));
        assert_eq!(fx.tiers.peek_main("foo"), Some(json!("remote")));

        // The pull is replicated with the primary's timestamp, not a new
        // one, so it never masks a concurrent deletion elsewhere.
        if let Some(flush) = fx.reconciler.flusher.current() {
            flush.await.unwrap();
        }
        let meta = replica.get_metadata("foo").await.unwrap().unwrap();
        assert_eq!(meta.set_time, 4_200);
        assert_eq!(*fx.set_times.get("foo").unwrap(), 4_200);
    }

    #[tokio::test]
    async fn sync_changed_with_expired_record_resolves_none() {
        let fx = fixture();
        fx.primary
            .set(Record::new("foo", json!("stale"), Some(1)), 200)
            .await
            .unwrap();

        let value = fx.reconciler.sync(RemoteState::Changed, "foo").await.unwrap();

        assert_eq!(value, None);
        assert_eq!(fx.tiers.peek_main("foo"), None);
        // The timestamp is still adopted so the next diff is Unchanged.
        assert_eq!(*fx.set_times.get("foo").unwrap(), 200);
        assert_eq!(
            fx.reconciler.diff("foo").await.unwrap(),
            RemoteState::Unchanged
        );
    }

    #[tokio::test]
    async fn sync_unchanged_reads_locally_without_store_calls() {
        let fx = fixture();
        fx.tiers.write("foo", json!("local"), None);

        let value = fx.reconciler.sync(RemoteState::Unchanged, "foo").await.unwrap();

        assert_eq!(value, Some(json!("local")));
        assert_eq!(fx.counting.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sync_changed_surfaces_pull_failures() {
        use crate::store::testing::FailingStore;

        let failing: Arc<dyn Store> = Arc::new(FailingStore::primary());
        let tiers = Arc::new(Tiers::new(1_000_000, 1_000_000, None));
        let set_times = Arc::new(DashMap::new());
        let flusher = Flusher::new(Arc::clone(&tiers), vec![], Arc::clone(&set_times));
        let reconciler = Reconciler::new(failing, Arc::clone(&tiers), set_times, flusher);

        tiers.write("foo", json!("local"), None);
        let err = reconciler.sync(RemoteState::Changed, "foo").await.unwrap_err();

        assert!(matches!(err, CacheError::Store(_)));
        // The local copy is untouched by the failed pull.
        assert_eq!(tiers.peek_main("foo"), Some(json!("local")));
    }

    #[tokio::test]
    async fn sync_missing_resolves_none_without_mutation() {
        let fx = fixture();
        let value = fx.reconciler.sync(RemoteState::Missing, "foo").await.unwrap();

        assert_eq!(value, None);
        assert_eq!(fx.counting.gets.load(Ordering::SeqCst), 0);
    }
}
