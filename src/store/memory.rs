//! In-memory store backend.
//!
//! Keeps records and metadata in process memory behind one mutex. Useful
//! as a replica target, as the shared remote in single-process tests, and
//! as the reference implementation of the store contract.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::StoreError;
use crate::glob;
use crate::record::{Metadata, Record};
use crate::store::{BoxFuture, Store};
use crate::time::epoch_ms;

/// In-memory implementation of the store contract.
pub struct MemoryStore {
    state: Mutex<State>,
    primary: bool,
    tombstone_ttl: Option<Duration>,
}

#[derive(Default)]
struct State {
    records: HashMap<String, Record>,
    metadata: HashMap<String, Metadata>,
    /// Keys in first-set order, for insertion-ordered listings.
    order: Vec<String>,
}

impl MemoryStore {
    /// Create a non-primary in-memory store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            primary: false,
            tombstone_ttl: None,
        }
    }

    /// Flag this store as the authoritative remote.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Purge tombstoned-only metadata older than `ttl` on read. A purged
    /// key reports "never existed" instead of "deleted" afterwards.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = Some(ttl);
        self
    }

    fn write_one(state: &mut State, record: Record, set_time: i64) {
        let key = record.key.clone();
        state
            .metadata
            .insert(key.clone(), Metadata::new(&key, set_time));
        if !state.order.contains(&key) {
            state.order.push(key.clone());
        }
        state.records.insert(key, record);
    }

    fn tombstone_one(state: &mut State, key: &str, set_time: i64) {
        state.records.remove(key);
        state
            .metadata
            .insert(key.to_string(), Metadata::new(key, set_time));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn has(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move { Ok(self.state.lock().unwrap().records.contains_key(&key)) })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move { Ok(self.state.lock().unwrap().records.get(&key).cloned()) })
    }

    fn mget(&self, keys: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<Record>>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(keys
                .iter()
                .map(|key| state.records.get(key).cloned())
                .collect())
        })
    }

    fn set(&self, record: Record, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            Self::write_one(&mut self.state.lock().unwrap(), record, set_time);
            Ok(())
        })
    }

    fn mset(
        &self,
        records: Vec<Record>,
        set_times: Vec<i64>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            for (record, set_time) in records.into_iter().zip(set_times) {
                Self::write_one(&mut state, record, set_time);
            }
            Ok(())
        })
    }

    fn del(&self, key: &str, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            Self::tombstone_one(&mut self.state.lock().unwrap(), &key, set_time);
            Ok(())
        })
    }

    fn mdel(&self, keys: Vec<String>, set_times: Vec<i64>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            for (key, set_time) in keys.iter().zip(set_times) {
                Self::tombstone_one(&mut state, key, set_time);
            }
            Ok(())
        })
    }

    fn keys(&self, pattern: Option<&str>) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let pattern = pattern.map(str::to_owned);
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state
                .order
                .iter()
                .filter(|key| state.records.contains_key(*key))
                .filter(|key| {
                    pattern
                        .as_deref()
                        .map_or(true, |pattern| glob::matches(pattern, key))
                })
                .cloned()
                .collect())
        })
    }

    fn values(&self) -> BoxFuture<'_, Result<Vec<Record>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(state
                .order
                .iter()
                .filter_map(|key| state.records.get(key).cloned())
                .collect())
        })
    }

    fn get_metadata(&self, key: &str) -> BoxFuture<'_, Result<Option<Metadata>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let Some(meta) = state.metadata.get(&key).cloned() else {
                return Ok(None);
            };
            // Expired tombstone: the key reverts to "never existed".
            if let Some(ttl) = self.tombstone_ttl {
                let tombstoned = !state.records.contains_key(&key);
                if tombstoned && epoch_ms() - meta.set_time > ttl.as_millis() as i64 {
                    state.metadata.remove(&key);
                    return Ok(None);
                }
            }
            Ok(Some(meta))
        })
    }

    fn set_metadata(&self, key: &str, metadata: Metadata) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            self.state.lock().unwrap().metadata.insert(key, metadata);
            Ok(())
        })
    }
}
