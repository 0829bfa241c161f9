//! File-based store backend.
//!
//! Each key becomes two flat files under the store directory, named by the
//! crc32 of the key (keys are arbitrary strings and routinely exceed
//! filename limits):
//!
//! ```text
//! {directory}/{crc32:x}.json        the record {"k", "v", "e"}
//! {directory}/{crc32:x}_meta.json   the metadata {"setTime", "key"}
//! ```
//!
//! The original key is recoverable from either document, so listings work
//! from the hashed layout. Record writes go through a temp file plus
//! rename; a record file that fails to parse is deleted on read and
//! treated as absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::glob;
use crate::record::{Metadata, Record};
use crate::store::{BoxFuture, Store};
use crate::time::epoch_ms;

/// File-per-record implementation of the store contract.
pub struct FileStore {
    directory: PathBuf,
    primary: bool,
    tombstone_ttl: Option<Duration>,
}

impl FileStore {
    /// Create a non-primary file store rooted at `directory`.
    ///
    /// The directory is created lazily on first write or listing.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            primary: false,
            tombstone_ttl: None,
        }
    }

    /// Flag this store as the authoritative remote.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Purge tombstoned-only metadata files older than `ttl` on read.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = Some(ttl);
        self
    }

    fn hashed(key: &str) -> String {
        format!("{:x}", crc32fast::hash(key.as_bytes()))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.json", Self::hashed(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}_meta.json", Self::hashed(key)))
    }

    async fn ensure_directory(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(StoreError::Io)
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn remove_ignoring_missing(path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Purge on read; the key becomes absent.
                warn!(key, error = %e, "malformed record file, purging");
                Self::remove_ignoring_missing(&path).await?;
                Ok(None)
            }
        }
    }

    async fn write_one(&self, record: &Record, set_time: i64) -> Result<(), StoreError> {
        let metadata = Metadata::new(&record.key, set_time);
        Self::write_json(&self.meta_path(&record.key), &metadata).await?;
        Self::write_json(&self.record_path(&record.key), record).await?;
        Ok(())
    }

    async fn tombstone_one(&self, key: &str, set_time: i64) -> Result<(), StoreError> {
        let metadata = Metadata::new(key, set_time);
        Self::write_json(&self.meta_path(key), &metadata).await?;
        Self::remove_ignoring_missing(&self.record_path(key)).await?;
        debug!(key, "tombstoned record");
        Ok(())
    }

    /// All `(file_name, path)` pairs under the store directory.
    async fn list_files(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        self.ensure_directory().await?;
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(StoreError::Io)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::Io)? {
            if let Ok(name) = entry.file_name().into_string() {
                files.push((name, entry.path()));
            }
        }
        Ok(files)
    }
}

impl Store for FileStore {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn has(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let path = self.record_path(key);
        Box::pin(async move {
            tokio::fs::try_exists(&path).await.map_err(StoreError::Io)
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move { self.read_record(&key).await })
    }

    fn mget(&self, keys: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<Record>>, StoreError>> {
        Box::pin(async move {
            let mut records = Vec::with_capacity(keys.len());
            for key in &keys {
                records.push(self.read_record(key).await?);
            }
            Ok(records)
        })
    }

    fn set(&self, record: Record, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.ensure_directory().await?;
            self.write_one(&record, set_time).await
        })
    }

    fn mset(
        &self,
        records: Vec<Record>,
        set_times: Vec<i64>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.ensure_directory().await?;
            for (record, set_time) in records.iter().zip(set_times) {
                self.write_one(record, set_time).await?;
            }
            Ok(())
        })
    }

    fn del(&self, key: &str, set_time: i64) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            self.ensure_directory().await?;
            self.tombstone_one(&key, set_time).await
        })
    }

    fn mdel(&self, keys: Vec<String>, set_times: Vec<i64>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.ensure_directory().await?;
            for (key, set_time) in keys.iter().zip(set_times) {
                self.tombstone_one(key, set_time).await?;
            }
            Ok(())
        })
    }

    fn keys(&self, pattern: Option<&str>) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let pattern = pattern.map(str::to_owned);
        Box::pin(async move {
            let mut live: Vec<Metadata> = Vec::new();
            for (name, path) in self.list_files().await? {
                let Some(stem) = name.strip_suffix("_meta.json") else {
                    continue;
                };
                let Ok(bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let Ok(meta) = serde_json::from_slice::<Metadata>(&bytes) else {
                    continue;
                };
                // Tombstoned-only metadata is excluded from listings.
                let record_path = self.directory.join(format!("{stem}.json"));
                if !tokio::fs::try_exists(&record_path)
                    .await
                    .map_err(StoreError::Io)?
                {
                    continue;
                }
                if let Some(pattern) = &pattern {
                    if !glob::matches(pattern, &meta.key) {
                        continue;
                    }
                }
                live.push(meta);
            }
            live.sort_by(|a, b| (a.set_time, &a.key).cmp(&(b.set_time, &b.key)));
            Ok(live.into_iter().map(|meta| meta.key).collect())
        })
    }

    fn values(&self) -> BoxFuture<'_, Result<Vec<Record>, StoreError>> {
        Box::pin(async move {
            let mut records = Vec::new();
            for (name, path) in self.list_files().await? {
                if !name.ends_with(".json") || name.ends_with("_meta.json") {
                    continue;
                }
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(StoreError::Io(e)),
                };
                match serde_json::from_slice::<Record>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        // Purge the record and its companion metadata.
                        warn!(file = %name, error = %e, "malformed record file, purging");
                        Self::remove_ignoring_missing(&path).await?;
                        if let Some(stem) = name.strip_suffix(".json") {
                            let meta_path =
                                self.directory.join(format!("{stem}_meta.json"));
                            Self::remove_ignoring_missing(&meta_path).await?;
                        }
                    }
                }
            }
            Ok(records)
        })
    }

    fn get_metadata(&self, key: &str) -> BoxFuture<'_, Result<Option<Metadata>, StoreError>> {
        let key = key.to_owned();
        Box::pin(async move {
            let path = self.meta_path(&key);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StoreError::Io(e)),
            };
            let meta = match serde_json::from_slice::<Metadata>(&bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(key, error = %e, "malformed metadata file, purging");
                    Self::remove_ignoring_missing(&path).await?;
                    return Ok(None);
                }
            };
            if let Some(ttl) = self.tombstone_ttl {
                let tombstoned = !tokio::fs::try_exists(&self.record_path(&key))
                    .await
                    .map_err(StoreError::Io)?;
                if tombstoned && epoch_ms() - meta.set_time > ttl.as_millis() as i64 {
                    Self::remove_ignoring_missing(&path).await?;
                    return Ok(None);
                }
            }
            Ok(Some(meta))
        })
    }

    fn set_metadata(&self, key: &str, metadata: Metadata) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = self.meta_path(key);
        Box::pin(async move {
            self.ensure_directory().await?;
            Self::write_json(&path, &metadata).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path())
    }

    #[tokio::test]
    async fn set_writes_record_and_metadata_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .set(Record::new("foo", json!("bar"), Some(1_546_358_459_000)), 1_546_358_400_000)
            .await
            .unwrap();

        // crc32("foo") = 0x8c736521
        let record_path = dir.path().join("8c736521.json");
        let meta_path = dir.path().join("8c736521_meta.json");
        assert!(record_path.exists());
        assert!(meta_path.exists());

        let contents: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&record_path).unwrap()).unwrap();
        assert_eq!(
            contents,
            json!({"k": "foo", "v": "bar", "e": 1_546_358_459_000_i64})
        );
    }

    #[tokio::test]
    async fn get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let record = Record::new("foo", json!({"a": [1, 2]}), None);
        store.set(record.clone(), 100).await.unwrap();

        assert_eq!(store.get("foo").await.unwrap(), Some(record));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn extremely_long_keys_hash_to_short_filenames() {
        let long_key = "feed_nba-media_video_lang=enUS&locale=en-US&filter%5Bpromoted%5D=true\
                        &skip=0&limit=8&sort%5BpublishDate%5D=-1&flatten=true&populate=20\
                        &simple=true__temp_meta"
            .repeat(3);
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .set(Record::new(&long_key, json!("bar"), None), 100)
            .await
            .unwrap();

        assert!(store.has(&long_key).await.unwrap());
        let fetched = store.get(&long_key).await.unwrap().unwrap();
        assert_eq!(fetched.key, long_key);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn del_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .set(Record::new("foo", json!("bar"), None), 100)
            .await
            .unwrap();
        store.del("foo", 200).await.unwrap();

        assert!(!store.has("foo").await.unwrap());
        assert_eq!(store.get("foo").await.unwrap(), None);
        assert!(store.keys(None).await.unwrap().is_empty());

        let meta = store.get_metadata("foo").await.unwrap().unwrap();
        assert_eq!(meta.set_time, 200);
        assert_eq!(meta.key, "foo");
    }

    #[tokio::test]
    async fn keys_recover_original_names_and_filter() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .set(Record::new("foo", json!(1), None), 100)
            .await
            .unwrap();
        store
            .set(Record::new("foo_34", json!(2), None), 200)
            .await
            .unwrap();
        store
            .set(Record::new("bar", json!(3), None), 300)
            .await
            .unwrap();

        assert_eq!(store.keys(None).await.unwrap(), vec!["foo", "foo_34", "bar"]);
        assert_eq!(
            store.keys(Some("foo*")).await.unwrap(),
            vec!["foo", "foo_34"]
        );
    }

    #[tokio::test]
    async fn values_purges_malformed_record_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .set(Record::new("good", json!("ok"), None), 100)
            .await
            .unwrap();
        std::fs::write(dir.path().join("deadbeef.json"), b"not json at all").unwrap();
        std::fs::write(dir.path().join("deadbeef_meta.json"), b"{}").unwrap();

        let values = store.values().await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].key, "good");

        // Both the malformed record and its metadata are gone.
        assert!(!dir.path().join("deadbeef.json").exists());
        assert!(!dir.path().join("deadbeef_meta.json").exists());
    }

    #[tokio::test]
    async fn malformed_record_purged_on_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = dir.path().join(format!("{:x}.json", crc32fast::hash(b"foo")));
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        assert_eq!(store.get("foo").await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn mset_and_mdel_batches() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .mset(
                vec![
                    Record::new("a", json!(1), None),
                    Record::new("b", json!(2), None),
                ],
                vec![100, 100],
            )
            .await
            .unwrap();
        assert_eq!(store.keys(None).await.unwrap().len(), 2);

        store
            .mdel(vec!["a".to_string(), "b".to_string()], vec![200, 200])
            .await
            .unwrap();
        assert!(store.keys(None).await.unwrap().is_empty());
        assert!(store.get_metadata("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tombstone_ttl_purges_metadata_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).with_tombstone_ttl(Duration::from_millis(10));
        store
            .set(Record::new("foo", json!("bar"), None), epoch_ms())
            .await
            .unwrap();
        store.del("foo", epoch_ms() - 60_000).await.unwrap();

        assert_eq!(store.get_metadata("foo").await.unwrap(), None);
        assert_eq!(store.check_if_has_newer("foo", None).await.unwrap(), None);
    }
}
