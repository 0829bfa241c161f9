//! In-memory tiers: the bounded main tier and the backup fallback tier.
//!
//! The main tier is a capacity-bounded, size-weighted table with per-entry
//! expiry and LRU eviction. Values leaving it through eviction or expiry
//! are not dropped: they move into the backup tier, a second, larger
//! weight-bounded table with no expiry that serves purely as a fallback
//! hint for `wrap` fetchers. A key lives in at most one tier at a time.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::config::WeighFn;
use crate::record::Record;
use crate::time::epoch_ms;

/// One entry in the main tier.
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiry, epoch milliseconds
    expires_at: Option<i64>,
    weight: usize,
    /// Stamp at first insertion, for insertion-ordered key listings
    inserted: u64,
    /// Stamp at last access, for LRU eviction
    touched: u64,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now_ms)
    }
}

/// Outcome of a main-tier read.
#[derive(Debug, PartialEq)]
pub enum TierRead {
    /// Live value (access time refreshed)
    Hit(Value),
    /// Entry was present but expired; it has been removed and its value
    /// is handed back so the caller can spill it to the backup tier
    Expired(Value),
    /// No entry
    Miss,
}

/// The bounded in-memory tier.
pub struct MainTier {
    entries: HashMap<String, Entry>,
    max_weight: usize,
    total_weight: usize,
    clock: u64,
}

impl MainTier {
    /// Create a tier with the given total weight bound.
    pub fn new(max_weight: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_weight,
            total_weight: 0,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert a value, evicting least-recently-used entries while the tier
    /// is over its weight bound. Returns the evicted `(key, value)` pairs
    /// so the caller can move them into the backup tier.
    pub fn set(
        &mut self,
        key: &str,
        value: Value,
        expires_at: Option<i64>,
        weight: usize,
    ) -> Vec<(String, Value)> {
        let stamp = self.tick();
        let inserted = match self.entries.remove(key) {
            Some(old) => {
                self.total_weight -= old.weight;
                old.inserted
            }
            None => stamp,
        };
        self.total_weight += weight;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                weight,
                inserted,
                touched: stamp,
            },
        );
        self.evict_over_weight()
    }

    /// Read a value, refreshing its LRU position. An expired entry is
    /// removed and returned as [`TierRead::Expired`].
    pub fn get(&mut self, key: &str, now_ms: i64) -> TierRead {
        let expired = match self.entries.get(key) {
            None => return TierRead::Miss,
            Some(entry) => entry.is_expired(now_ms),
        };
        if expired {
            let entry = self.entries.remove(key).expect("entry checked above");
            self.total_weight -= entry.weight;
            return TierRead::Expired(entry.value);
        }
        let stamp = self.tick();
        let entry = self.entries.get_mut(key).expect("entry checked above");
        entry.touched = stamp;
        TierRead::Hit(entry.value.clone())
    }

    /// Read a value without refreshing its LRU position or evicting it.
    pub fn peek(&self, key: &str, now_ms: i64) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| entry.value.clone())
    }

    /// Read a full record (value plus expiry) without side effects.
    pub fn peek_record(&self, key: &str, now_ms: i64) -> Option<Record> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| Record::new(key, entry.value.clone(), entry.expires_at))
    }

    /// Remove an entry. Returns the value only if it was still live.
    pub fn delete(&mut self, key: &str, now_ms: i64) -> Option<Value> {
        let entry = self.entries.remove(key)?;
        self.total_weight -= entry.weight;
        if entry.is_expired(now_ms) {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Live keys in insertion order.
    pub fn keys(&self, now_ms: i64) -> Vec<String> {
        let mut live: Vec<(&String, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now_ms))
            .map(|(key, entry)| (key, entry.inserted))
            .collect();
        live.sort_by_key(|(_, inserted)| *inserted);
        live.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Live values in insertion order.
    pub fn values(&self, now_ms: i64) -> Vec<Value> {
        self.keys(now_ms)
            .iter()
            .filter_map(|key| self.entries.get(key).map(|e| e.value.clone()))
            .collect()
    }

    /// Number of entries, including not-yet-collected expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current total weight.
    pub fn total_weight(&self) -> usize {
        self.total_weight
    }

    fn evict_over_weight(&mut self) -> Vec<(String, Value)> {
        let mut evicted = Vec::new();
        while self.total_weight > self.max_weight {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else { break };
            let entry = self.entries.remove(&key).expect("victim exists");
            self.total_weight -= entry.weight;
            evicted.push((key, entry.value));
        }
        evicted
    }
}

/// The backup fallback tier.
///
/// Holds the most recent evicted or expired value per key. No per-entry
/// expiry; its own (larger) weight bound evicts the oldest entry first.
pub struct BackupTier {
    entries: HashMap<String, BackupEntry>,
    max_weight: usize,
    total_weight: usize,
    clock: u64,
}

struct BackupEntry {
    value: Value,
    weight: usize,
    stamp: u64,
}

impl BackupTier {
    /// Create a backup tier with the given total weight bound.
    pub fn new(max_weight: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_weight,
            total_weight: 0,
            clock: 0,
        }
    }

    /// Store the latest fallback value for a key, displacing any previous
    /// one and evicting the oldest entries while over the weight bound.
    pub fn insert(&mut self, key: &str, value: Value, weight: usize) {
        self.clock += 1;
        if let Some(old) = self.entries.remove(key) {
            self.total_weight -= old.weight;
        }
        self.total_weight += weight;
        self.entries.insert(
            key.to_string(),
            BackupEntry {
                value,
                weight,
                stamp: self.clock,
            },
        );
        while self.total_weight > self.max_weight {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stamp)
                .map(|(key, _)| key.clone());
            let Some(key) = victim else { break };
            let entry = self.entries.remove(&key).expect("victim exists");
            self.total_weight -= entry.weight;
        }
    }

    /// Read the fallback value for a key.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Remove the fallback value for a key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let entry = self.entries.remove(key)?;
        self.total_weight -= entry.weight;
        Some(entry.value)
    }

    /// Number of fallback entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Both tiers behind their locks, with the cross-tier operations.
///
/// Lock order is always main before backup; no lock is held across an
/// await point.
pub(crate) struct Tiers {
    pub(crate) main: Mutex<MainTier>,
    pub(crate) backup: Mutex<BackupTier>,
    weigher: Option<WeighFn>,
}

impl Tiers {
    pub fn new(max_weight: usize, backup_max_weight: usize, weigher: Option<WeighFn>) -> Self {
        Self {
            main: Mutex::new(MainTier::new(max_weight)),
            backup: Mutex::new(BackupTier::new(backup_max_weight)),
            weigher,
        }
    }

    pub fn weight_of(&self, key: &str, value: &Value) -> usize {
        match &self.weigher {
            Some(weigher) => weigher(key, value),
            None => serde_json::to_string(value).map(|s| s.len()).unwrap_or(1),
        }
    }

    /// Main-tier read with LRU touch; an expired value spills into the
    /// backup tier before the read reports a miss.
    pub fn local_get(&self, key: &str) -> Option<Value> {
        let now = epoch_ms();
        let outcome = self.main.lock().unwrap().get(key, now);
        match outcome {
            TierRead::Hit(value) => Some(value),
            TierRead::Expired(value) => {
                let weight = self.weight_of(key, &value);
                self.backup.lock().unwrap().insert(key, value, weight);
                None
            }
            TierRead::Miss => None,
        }
    }

    pub fn peek_main(&self, key: &str) -> Option<Value> {
        self.main.lock().unwrap().peek(key, epoch_ms())
    }

    pub fn peek_backup(&self, key: &str) -> Option<Value> {
        self.backup.lock().unwrap().peek(key)
    }

    /// The previous value as `set` equality checks see it: the live main
    /// entry, else the backup fallback.
    pub fn peek_prior(&self, key: &str) -> Option<Value> {
        self.peek_main(key).or_else(|| self.peek_backup(key))
    }

    pub fn peek_record(&self, key: &str, now_ms: i64) -> Option<Record> {
        self.main.lock().unwrap().peek_record(key, now_ms)
    }

    /// Write a value into the main tier, clearing any backup entry for the
    /// key and spilling evicted entries into the backup tier.
    pub fn write(&self, key: &str, value: Value, expires_at: Option<i64>) {
        let weight = self.weight_of(key, &value);
        let evicted = self.main.lock().unwrap().set(key, value, expires_at, weight);
        let mut backup = self.backup.lock().unwrap();
        backup.remove(key);
        for (evicted_key, evicted_value) in evicted {
            let weight = self.weight_of(&evicted_key, &evicted_value);
            backup.insert(&evicted_key, evicted_value, weight);
        }
    }

    /// Apply a store record verbatim, trusting its own expiry. Returns the
    /// applied value, or `None` when the record is already expired.
    pub fn apply_record(&self, record: Record) -> Option<Value> {
        if record.is_expired(epoch_ms()) {
            return None;
        }
        let Record {
            key,
            value,
            expires_at,
        } = record;
        self.write(&key, value.clone(), expires_at);
        Some(value)
    }

    /// Remove a key from both tiers. Used when the remote store reports
    /// the key deleted: the fallback copy goes too. Returns the live
    /// main-tier value the key had.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let prior = self.main.lock().unwrap().delete(key, epoch_ms());
        self.backup.lock().unwrap().remove(key);
        prior
    }

    /// Remove a key from the main tier, keeping its live value as the
    /// backup fallback. Used by explicit local deletion, so a later
    /// `wrap` fetcher still gets a last-good hint. Returns the live
    /// main-tier value the key had, which decides whether a tombstone
    /// event is emitted.
    pub fn remove_to_backup(&self, key: &str) -> Option<Value> {
        let prior = self.main.lock().unwrap().delete(key, epoch_ms());
        if let Some(value) = &prior {
            let weight = self.weight_of(key, value);
            self.backup.lock().unwrap().insert(key, value.clone(), weight);
        }
        prior
    }

    pub fn keys(&self) -> Vec<String> {
        self.main.lock().unwrap().keys(epoch_ms())
    }

    pub fn values(&self) -> Vec<Value> {
        self.main.lock().unwrap().values(epoch_ms())
    }

    /// Load records into the main tier, skipping already-expired ones.
    pub fn load(&self, records: Vec<Record>) {
        let now = epoch_ms();
        for record in records {
            if record.is_expired(now) {
                continue;
            }
            let weight = self.weight_of(&record.key, &record.value);
            let evicted = self.main.lock().unwrap().set(
                &record.key,
                record.value,
                record.expires_at,
                weight,
            );
            let mut backup = self.backup.lock().unwrap();
            backup.remove(&record.key);
            for (evicted_key, evicted_value) in evicted {
                let weight = self.weight_of(&evicted_key, &evicted_value);
                backup.insert(&evicted_key, evicted_value, weight);
            }
        }
    }
}
