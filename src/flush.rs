//! Batched persistence of local changes to the backing stores.
//!
//! The engine records every accepted mutation here. At most one flush
//! cycle runs per engine instance: keys noted while a cycle is in flight
//! accumulate into a pending set that the same cycle drains in follow-up
//! iterations, so a burst of changes costs a bounded number of store
//! round-trips. Awaiting the returned handle therefore covers the noted
//! keys and everything coalesced after them.
//!
//! A flush snapshots the main tier at write time: keys still live there
//! are batched into `mset`, keys no longer present (deleted, expired, or
//! evicted since the note) are batched into `mdel`. Each configured store
//! receives both batches independently; a failing store is logged and the
//! first failure is reported when the cycle settles.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::store::{BoxFuture, Store};
use crate::tier::Tiers;
use crate::time::epoch_ms;

/// Cloneable handle to an in-flight flush cycle.
pub(crate) type FlushHandle = Shared<BoxFuture<'static, Result<(), CacheError>>>;

#[derive(Default)]
struct FlushState {
    /// Keys awaiting the next iteration, in first-noted order.
    pending: Vec<String>,
    in_flight: Option<FlushHandle>,
}

/// Persists changed keys to every configured store.
pub(crate) struct Flusher {
    tiers: Arc<Tiers>,
    stores: Vec<Arc<dyn Store>>,
    set_times: Arc<DashMap<String, i64>>,
    state: Mutex<FlushState>,
}

impl Flusher {
    pub fn new(
        tiers: Arc<Tiers>,
        stores: Vec<Arc<dyn Store>>,
        set_times: Arc<DashMap<String, i64>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tiers,
            stores,
            set_times,
            state: Mutex::new(FlushState::default()),
        })
    }

    /// Record mutation timestamps for `keys` and schedule their
    /// persistence. Returns a handle resolving when the covering flush
    /// cycle settles; the cycle itself runs on a spawned task, so callers
    /// may drop the handle.
    pub fn note_change(self: &Arc<Self>, keys: Vec<String>, timestamp: i64) -> FlushHandle {
        for key in &keys {
            self.set_times.insert(key.clone(), timestamp);
        }

        let mut state = self.state.lock().unwrap();
        for key in keys {
            if !state.pending.contains(&key) {
                state.pending.push(key);
            }
        }
        if let Some(flush) = &state.in_flight {
            return flush.clone();
        }

        let flusher = Arc::clone(self);
        let cycle: BoxFuture<'static, Result<(), CacheError>> =
            Box::pin(async move { flusher.run_cycle().await });
        let handle = cycle.shared();
        state.in_flight = Some(handle.clone());
        drop(state);

        tokio::spawn(handle.clone());
        handle
    }

    /// The in-flight flush cycle, if one is running.
    pub fn current(&self) -> Option<FlushHandle> {
        self.state.lock().unwrap().in_flight.clone()
    }

    async fn run_cycle(&self) -> Result<(), CacheError> {
        let mut first_error: Option<CacheError> = None;
        loop {
            // Taking the batch and retiring the cycle are one critical
            // section, so a key noted concurrently lands either in this
            // cycle's next iteration or in a fresh cycle, never nowhere.
            let batch = {
                let mut state = self.state.lock().unwrap();
                if state.pending.is_empty() {
                    state.in_flight = None;
                    break;
                }
                std::mem::take(&mut state.pending)
            };
            if let Err(e) = self.flush_batch(batch).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn flush_batch(&self, keys: Vec<String>) -> Result<(), CacheError> {
        let now = epoch_ms();
        let mut records = Vec::new();
        let mut record_times = Vec::new();
        let mut deleted_keys = Vec::new();
        let mut deleted_times = Vec::new();
        for key in keys {
            let timestamp = self.set_times.get(&key).map(|t| *t).unwrap_or(now);
            match self.tiers.peek_record(&key, now) {
                Some(record) => {
                    records.push(record);
                    record_times.push(timestamp);
                }
                None => {
                    deleted_keys.push(key);
                    deleted_times.push(timestamp);
                }
            }
        }
        debug!(
            sets = records.len(),
            deletes = deleted_keys.len(),
            "flushing changes to stores"
        );

        let mut first_error: Option<CacheError> = None;
        for store in &self.stores {
            if !records.is_empty() {
                if let Err(e) = store.mset(records.clone(), record_times.clone()).await {
                    warn!(error = %e, "store mset failed during flush");
                    first_error.get_or_insert(e.into());
                }
            }
            if !deleted_keys.is_empty() {
                if let Err(e) = store.mdel(deleted_keys.clone(), deleted_times.clone()).await {
                    warn!(error = %e, "store mdel failed during flush");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::CountingStore;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn flusher_over(stores: Vec<Arc<dyn Store>>) -> (Arc<Tiers>, Arc<Flusher>) {
        let tiers = Arc::new(Tiers::new(1_000_000, 1_000_000, None));
        let set_times = Arc::new(DashMap::new());
        let flusher = Flusher::new(Arc::clone(&tiers), stores, set_times);
        (tiers, flusher)
    }

    #[tokio::test]
    async fn live_keys_persist_with_recorded_timestamps() {
        let store = Arc::new(MemoryStore::new());
        let (tiers, flusher) = flusher_over(vec![store.clone()]);

        tiers.write("foo", json!("bar"), None);
        flusher
            .note_change(vec!["foo".to_string()], 12_345)
            .await
            .unwrap();

        let record = store.get("foo").await.unwrap().unwrap();
        assert_eq!(record.value, json!("bar"));
        let meta = store.get_metadata("foo").await.unwrap().unwrap();
        assert_eq!(meta.set_time, 12_345);
    }

    #[tokio::test]
    async fn absent_keys_become_tombstones() {
        let store = Arc::new(MemoryStore::new());
        let (_tiers, flusher) = flusher_over(vec![store.clone()]);

        flusher
            .note_change(vec!["gone".to_string()], 500)
            .await
            .unwrap();

        assert!(!store.has("gone").await.unwrap());
        let meta = store.get_metadata("gone").await.unwrap().unwrap();
        assert_eq!(meta.set_time, 500);
    }

    #[tokio::test]
    async fn multiple_deletes_share_one_batch() {
        let counting = Arc::new(CountingStore::wrap(Arc::new(MemoryStore::new())));
        let (_tiers, flusher) = flusher_over(vec![counting.clone()]);

        flusher
            .note_change(
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                100,
            )
            .await
            .unwrap();

        assert_eq!(counting.mdels.load(Ordering::SeqCst), 1);
        assert_eq!(counting.msets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn changes_during_flush_coalesce_into_one_follow_up() {
        let counting = Arc::new(
            CountingStore::wrap(Arc::new(MemoryStore::new()))
                .with_write_delay(Duration::from_millis(100)),
        );
        let (tiers, flusher) = flusher_over(vec![counting.clone()]);

        tiers.write("a", json!(1), None);
        let handle = flusher.note_change(vec!["a".to_string()], 100);

        // Let the cycle enter its (slow) store write, then pile on.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tiers.write("b", json!(2), None);
        tiers.write("c", json!(3), None);
        let _b = flusher.note_change(vec!["b".to_string()], 200);
        let _c = flusher.note_change(vec!["c".to_string()], 300);

        handle.await.unwrap();

        // "b" and "c" were written by a single follow-up iteration.
        assert_eq!(counting.msets.load(Ordering::SeqCst), 2);
        assert!(flusher.current().is_none());
    }

    #[tokio::test]
    async fn noting_while_idle_starts_a_fresh_cycle() {
        let store = Arc::new(MemoryStore::new());
        let (tiers, flusher) = flusher_over(vec![store.clone()]);

        tiers.write("a", json!(1), None);
        flusher.note_change(vec!["a".to_string()], 100).await.unwrap();
        assert!(flusher.current().is_none());

        tiers.write("b", json!(2), None);
        flusher.note_change(vec!["b".to_string()], 200).await.unwrap();

        assert!(store.has("a").await.unwrap());
        assert!(store.has("b").await.unwrap());
    }

    #[tokio::test]
    async fn every_store_receives_the_batch() {
        let primary = Arc::new(MemoryStore::new().with_primary(true));
        let replica = Arc::new(MemoryStore::new());
        let (tiers, flusher) = flusher_over(vec![primary.clone(), replica.clone()]);

        tiers.write("foo", json!("bar"), None);
        flusher
            .note_change(vec!["foo".to_string()], 100)
            .await
            .unwrap();

        assert!(primary.has("foo").await.unwrap());
        assert!(replica.has("foo").await.unwrap());
    }
}
