//! The cache engine.
//!
//! [`Cache`] ties the pieces together: the in-memory tiers, the optional
//! backing stores with their flusher, and the reconciler that keeps this
//! instance coherent with a primary store shared by other instances.
//!
//! ### Read path
//!
//! With a primary store configured, `get` first diffs the key against the
//! remote metadata. A remote deletion or change is always folded in before
//! the read returns; for an unchanged or missing key the stale-while-
//! refreshing policy decides whether the caller waits on the sync or is
//! served the local value immediately.
//!
//! ### Write path
//!
//! `set` reconciles the key first, then applies the cacheable predicate
//! and a structural equality check against the previous value. Only a
//! genuinely changed, cacheable value schedules a persistence flush.
//! `del` is a re-check signal as much as a removal: a key the remote has
//! changed in the meantime is refreshed instead of deleted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, CacheableFn, TtlPolicy};
use crate::error::CacheError;
use crate::flush::Flusher;
use crate::glob;
use crate::reconcile::{Reconciler, RemoteState};
use crate::record::Record;
use crate::store::{BoxFuture, Store};
use crate::tier::Tiers;
use crate::time::{epoch_ms, expiry_after};

type FetchHandle = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

/// A multi-tier cache instance. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    ttl: TtlPolicy,
    cacheable: CacheableFn,
    return_stale: bool,
    tiers: Arc<Tiers>,
    stores: Vec<Arc<dyn Store>>,
    flusher: Arc<Flusher>,
    reconciler: Option<Arc<Reconciler>>,
    /// One in-flight fetcher per key.
    fetches: DashMap<String, FetchHandle>,
}

impl Cache {
    /// Build a cache from its configuration. At most one configured store
    /// should flag itself primary; without one, no reconciliation runs and
    /// all stores are write-only replicas.
    pub fn new(config: CacheConfig) -> Self {
        let tiers = Arc::new(Tiers::new(
            config.max_weight,
            config.backup_max_weight,
            config.weigher.clone(),
        ));
        let set_times = Arc::new(DashMap::new());
        let flusher = Flusher::new(
            Arc::clone(&tiers),
            config.stores.clone(),
            Arc::clone(&set_times),
        );
        let primary = config.stores.iter().find(|s| s.is_primary()).cloned();
        let reconciler = primary.map(|primary| {
            Reconciler::new(
                primary,
                Arc::clone(&tiers),
                Arc::clone(&set_times),
                Arc::clone(&flusher),
            )
        });
        Self {
            inner: Arc::new(CacheInner {
                ttl: config.ttl,
                cacheable: config.cacheable,
                return_stale: config.return_stale_while_refreshing,
                tiers,
                stores: config.stores,
                flusher,
                reconciler,
                fetches: DashMap::new(),
            }),
        }
    }

    /// Populate the in-memory tiers, either from the given snapshot or
    /// from the read store's persisted values. Already-expired records are
    /// skipped.
    pub async fn load(&self, snapshot: Option<Vec<Record>>) -> Result<(), CacheError> {
        let records = match snapshot {
            Some(records) => records,
            None => match self.inner.read_store() {
                Some(store) => store.values().await?,
                None => Vec::new(),
            },
        };
        info!(count = records.len(), "loading records");
        self.inner.tiers.load(records);
        Ok(())
    }

    /// [`Cache::load`] from the read store.
    pub async fn init(&self) -> Result<(), CacheError> {
        self.load(None).await
    }

    /// Read a key, reconciling it against the primary store first when one
    /// is configured.
    ///
    /// Under the stale-while-refreshing policy a store-transport failure
    /// during reconciliation is logged and the local value served; with
    /// the policy disabled it propagates to the caller.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let Some(reconciler) = &self.inner.reconciler else {
            return Ok(self.inner.tiers.local_get(key));
        };
        let state = match reconciler.diff(key).await {
            Ok(state) => state,
            Err(e) if self.inner.return_stale => {
                warn!(key, error = %e, "remote diff failed, serving local value");
                return Ok(self.inner.tiers.local_get(key));
            }
            Err(e) => return Err(e),
        };
        let sync = reconciler.sync(state, key);
        let must_wait = matches!(state, RemoteState::Deleted | RemoteState::Changed)
            || !self.inner.return_stale;
        if !must_wait {
            tokio::spawn(sync);
            return Ok(self.inner.tiers.local_get(key));
        }
        match sync.await {
            Ok(value) => Ok(value),
            Err(e) if self.inner.return_stale => {
                warn!(key, error = %e, "sync failed, serving local value");
                Ok(self.inner.tiers.local_get(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Write a key. The TTL override takes precedence over the configured
    /// policy. Resolves once the local tiers are updated; persistence runs
    /// in the background (see [`Cache::wait_for_flush`]).
    ///
    /// Reconciliation failures follow the same policy as [`Cache::get`]:
    /// logged under stale-while-refreshing, propagated otherwise.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.inner.set_value(key, value, ttl).await
    }

    /// Apply a persisted record verbatim, trusting its own expiry. No
    /// change event is emitted: the record is already persisted state.
    pub fn set_serialized(&self, record: Record) -> Option<Value> {
        self.inner.tiers.apply_record(record)
    }

    /// Read-through: a reconciled `get`, falling back to `fetcher` on a
    /// miss. The fetcher receives the key's last-good value (the backup
    /// tier's copy) as a hint and its result is stored via the `set` path.
    ///
    /// One fetcher runs per key at a time; concurrent wrappers share its
    /// outcome. When the fetcher fails, the last-good value is served if
    /// one exists; under the stale-while-refreshing policy it is served
    /// immediately while the fetcher runs in the background.
    pub async fn wrap<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> Result<Value, CacheError>
    where
        F: FnOnce(Option<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let last_good = self.inner.tiers.peek_backup(key);
        let fetch = self.spawn_fetch(key, fetcher, ttl, last_good.clone());
        if self.inner.return_stale {
            if let Some(stale) = last_good {
                tokio::spawn(fetch);
                return Ok(stale);
            }
        }
        match fetch.await {
            Ok(value) => Ok(value),
            Err(e) => match last_good {
                Some(stale) => {
                    warn!(key, error = %e, "fetch failed, serving last-good value");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    fn spawn_fetch<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
        hint: Option<Value>,
    ) -> FetchHandle
    where
        F: FnOnce(Option<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if let Some(existing) = self.inner.fetches.get(key) {
            return existing.clone();
        }
        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        let fut: BoxFuture<'static, Result<Value, CacheError>> = Box::pin(async move {
            let result = match fetcher(hint).await {
                Ok(value) => inner
                    .set_value(&owned, value.clone(), ttl)
                    .await
                    .map(|()| value),
                Err(e) => {
                    warn!(key = %owned, error = %e, "fetcher failed");
                    Err(CacheError::FetchFailed {
                        key: owned.clone(),
                        message: e.to_string(),
                    })
                }
            };
            inner.fetches.remove(&owned);
            result
        });
        match self.inner.fetches.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = fut.shared();
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Delete a single key. See [`Cache::del`].
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.del(&[key]).await
    }

    /// Delete keys, tombstoning them in every store. Deletion doubles as a
    /// re-check signal: a key the primary has changed since our copy is
    /// refreshed instead of deleted. The deleted value survives as the
    /// backup-tier fallback, so a later `wrap` still gets a last-good
    /// hint. Resolves once the covering flush settles, so remote
    /// tombstones are visible afterwards.
    pub async fn del(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut tombstoned = Vec::new();
        for &key in keys {
            if let Some(reconciler) = &self.inner.reconciler {
                match reconciler.diff(key).await {
                    Ok(RemoteState::Changed) => {
                        debug!(key, "remote changed since our copy, refreshing instead");
                        if let Err(e) = reconciler.sync(RemoteState::Changed, key).await {
                            warn!(key, error = %e, "refresh failed, keeping local copy");
                        }
                        continue;
                    }
                    // Deleted needs no sync: the removal happens right here.
                    Ok(_) => {}
                    Err(e) => {
                        warn!(key, error = %e, "remote diff failed, deleting locally");
                    }
                }
            }
            let prior = self.inner.tiers.remove_to_backup(key);
            if prior.is_some() {
                tombstoned.push(key.to_string());
            }
        }
        if tombstoned.is_empty() {
            return Ok(());
        }
        debug!(count = tombstoned.len(), "tombstoning deleted keys");
        self.inner.flusher.note_change(tombstoned, epoch_ms()).await
    }

    /// Live keys, glob-filtered when a pattern is given. Delegates to the
    /// read store when one is configured, else lists the main tier in
    /// insertion order.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, CacheError> {
        match self.inner.read_store() {
            Some(store) => Ok(store.keys(pattern).await?),
            None => {
                let keys = self.inner.tiers.keys();
                Ok(match pattern {
                    Some(pattern) => keys
                        .into_iter()
                        .filter(|key| glob::matches(pattern, key))
                        .collect(),
                    None => keys,
                })
            }
        }
    }

    /// Live values, from the read store when one is configured.
    pub async fn values(&self) -> Result<Vec<Value>, CacheError> {
        match self.inner.read_store() {
            Some(store) => Ok(store
                .values()
                .await?
                .into_iter()
                .map(|record| record.value)
                .collect()),
            None => Ok(self.inner.tiers.values()),
        }
    }

    /// Delete every key [`Cache::keys`] reports.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let keys = self.keys(None).await?;
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.del(&refs).await
    }

    /// Await the in-flight flush cycle, if any. Afterwards every change
    /// noted before this call is persisted.
    pub async fn wait_for_flush(&self) -> Result<(), CacheError> {
        match self.inner.flusher.current() {
            Some(flush) => flush.await,
            None => Ok(()),
        }
    }
}

impl CacheInner {
    /// The store serving reads and listings: the primary, else the first.
    fn read_store(&self) -> Option<&Arc<dyn Store>> {
        self.stores
            .iter()
            .find(|store| store.is_primary())
            .or_else(|| self.stores.first())
    }

    fn expiry_for(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Option<i64> {
        let ttl = ttl.or_else(|| match &self.ttl {
            TtlPolicy::Unbounded => None,
            TtlPolicy::Fixed(ttl) => Some(*ttl),
            TtlPolicy::PerEntry(derive) => Some(derive(key, value)),
        });
        ttl.map(expiry_after)
    }

    async fn set_value(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        // Fold in any newer remote state first, so the equality check below
        // runs against the latest value rather than a stale local copy.
        if let Some(reconciler) = &self.reconciler {
            let outcome = match reconciler.diff(key).await {
                Ok(state @ (RemoteState::Deleted | RemoteState::Changed)) => {
                    reconciler.sync(state, key).await.map(|_| ())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if self.return_stale => {
                    warn!(key, error = %e, "reconciliation failed, setting anyway");
                }
                Err(e) => return Err(e),
            }
        }

        if !(self.cacheable)(&value) {
            debug!(key, "value not cacheable, skipping");
            return Ok(());
        }
        let changed = self.tiers.peek_prior(key).as_ref() != Some(&value);
        let expires_at = self.expiry_for(key, &value, ttl);
        self.tiers.write(key, value, expires_at);
        if changed {
            debug!(key, "value changed, scheduling flush");
            let _flush = self.flusher.note_change(vec![key.to_string()], epoch_ms());
        }
        Ok(())
    }
}
