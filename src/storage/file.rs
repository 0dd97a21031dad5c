use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::core::config::{Config, LanguageConfig, Provider};
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord};
use crate::index::in_memory::InMemoryIndex;
use crate::query::matcher::DocumentMatcher;
use crate::query::order::execute;
use crate::query::types::{BulkDelete, BulkInsert, FindOptions, FindResult, RemoveRequest};
use crate::storage::backend::{cascade_routes, prepare_bulk, prepare_write, validate_partition, StorageBackend};
use crate::storage::file_lock::FileLock;
use crate::storage::partition_cache::{CacheStats, PartitionCache};

/// One JSON array of `StoredRecord` per `(locale, content type)`:
/// `<content_path>/<ct>.json`, and `<assets_path>/_assets.json` for assets.
///
/// Writers to a partition are serialized by a per-file mutex and every write
/// stages the whole new array in a temporary file that is renamed over the
/// old one, so readers see the old or the new partition and nothing between.
pub struct FileBackend {
    languages: HashMap<String, LanguageConfig>,
    index: Arc<InMemoryIndex>,
    cache: PartitionCache,
    write_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    _locks: Vec<FileLock>,
}

impl FileBackend {
    pub async fn open(config: &Config, index: Arc<InMemoryIndex>) -> Result<Self> {
        let mut locks = Vec::with_capacity(config.languages.len());
        for language in &config.languages {
            for dir in [&language.content_path, &language.assets_path] {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::storage(format!("Creating {}", dir.display()), e))?;
            }
            locks.push(FileLock::acquire(&language.content_path)?);
        }

        info!(languages = config.languages.len(), "file backend opened");
        Ok(FileBackend {
            languages: config
                .languages
                .iter()
                .map(|language| (language.code.clone(), language.clone()))
                .collect(),
            index,
            cache: PartitionCache::new(config.partition_cache_size),
            write_locks: Mutex::new(HashMap::new()),
            _locks: locks,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn partition_path(&self, partition: &Partition) -> Result<PathBuf> {
        validate_partition(partition)?;
        let language = self.languages.get(&partition.locale).ok_or_else(|| {
            Error::invalid_argument(format!("Language '{}' is not configured", partition.locale))
        })?;
        let root = if partition.is_assets() { &language.assets_path } else { &language.content_path };
        Ok(root.join(format!("{}.json", partition.content_type_uid)))
    }

    fn partition_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_partition(&self, path: &Path) -> Result<Arc<Vec<StoredRecord>>> {
        if let Some(records) = self.cache.get(path) {
            return Ok(records);
        }
        // Misses populate the cache under the writer lock so a slow read can
        // never overwrite a fresher entry.
        let lock = self.partition_lock(path);
        let _guard = lock.lock().await;
        self.read_locked(path).await
    }

    async fn read_locked(&self, path: &Path) -> Result<Arc<Vec<StoredRecord>>> {
        if let Some(records) = self.cache.get(path) {
            return Ok(records);
        }
        let records: Vec<StoredRecord> = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::storage(format!("Corrupt partition {}", path.display()), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::storage(format!("Reading {}", path.display()), e)),
        };
        let records = Arc::new(records);
        self.cache.put(path.to_path_buf(), Arc::clone(&records));
        Ok(records)
    }

    /// Caller holds the partition lock.
    async fn write_partition(&self, path: &Path, records: Vec<StoredRecord>) -> Result<Arc<Vec<StoredRecord>>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("Creating {}", parent.display()), e))?;
        }
        let bytes = serde_json::to_vec(&records)?;
        let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("partition");
        let staging = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            return Err(Error::storage(format!("Staging {}", staging.display()), e));
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                warn!(path = %staging.display(), error = %cleanup, "staging file left behind");
            }
            return Err(Error::storage(format!("Replacing {}", path.display()), e));
        }

        let records = Arc::new(records);
        self.cache.put(path.to_path_buf(), Arc::clone(&records));
        debug!(path = %path.display(), count = records.len(), bytes = bytes.len(), "partition written");
        Ok(records)
    }

    async fn write_record(&self, mut record: StoredRecord, replace: bool) -> Result<()> {
        prepare_write(&mut record)?;
        let path = self.partition_path(&record.partition())?;
        let lock = self.partition_lock(&path);
        let _guard = lock.lock().await;

        let current = self.read_locked(&path).await?;
        let position = current.iter().position(|stored| stored.uid == record.uid);
        let mut records = current.as_ref().clone();
        match position {
            Some(_) if !replace => {
                return Err(Error::already_exists(format!(
                    "{} already holds '{}'",
                    record.partition(),
                    record.uid
                )))
            }
            Some(at) => records[at] = record.clone(),
            None => records.push(record.clone()),
        }

        self.write_partition(&path, records).await?;
        self.index.record_written(&record);
        Ok(())
    }

    async fn drop_partition(&self, partition: &Partition) -> Result<usize> {
        let path = self.partition_path(partition)?;
        let removed = {
            let lock = self.partition_lock(&path);
            let _guard = lock.lock().await;
            let removed = self.read_locked(&path).await?.len();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::storage(format!("Removing {}", path.display()), e)),
            }
            self.cache.invalidate(&path);
            self.index.partition_dropped(partition);
            removed
        };
        info!(partition = %partition, removed, "partition dropped");
        cascade_routes(self, partition).await?;
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> Provider {
        Provider::File
    }

    async fn find(&self, partition: &Partition, filter: &Map<String, Value>, options: &FindOptions) -> Result<FindResult> {
        let matcher = DocumentMatcher::new(filter)?;
        let path = self.partition_path(partition)?;
        let records = self.read_partition(&path).await?;
        Ok(execute(records.iter(), &matcher, options))
    }

    async fn insert(&self, record: StoredRecord) -> Result<()> {
        self.write_record(record, false).await
    }

    async fn upsert(&self, record: StoredRecord) -> Result<()> {
        self.write_record(record, true).await
    }

    async fn remove(&self, request: &RemoveRequest) -> Result<usize> {
        let Some(uids) = &request.uids else {
            return self.drop_partition(&request.partition).await;
        };

        let path = self.partition_path(&request.partition)?;
        let lock = self.partition_lock(&path);
        let _guard = lock.lock().await;

        let current = self.read_locked(&path).await?;
        let remaining: Vec<StoredRecord> = current
            .iter()
            .filter(|record| !uids.contains(&record.uid))
            .cloned()
            .collect();
        let removed = current.len() - remaining.len();
        if removed == 0 {
            return Ok(0);
        }

        self.write_partition(&path, remaining).await?;
        self.index.records_removed(&request.partition, uids);
        Ok(removed)
    }

    async fn bulk_insert(&self, mut request: BulkInsert) -> Result<usize> {
        prepare_bulk(&mut request)?;
        let path = self.partition_path(&request.partition)?;
        let lock = self.partition_lock(&path);
        let _guard = lock.lock().await;

        let written = self.write_partition(&path, request.records).await?;
        self.index.partition_replaced(&request.partition, &written);
        info!(partition = %request.partition, count = written.len(), "partition replaced");
        Ok(written.len())
    }

    async fn bulk_delete(&self, request: &BulkDelete) -> Result<usize> {
        let matcher = DocumentMatcher::new(&request.to_filter())?;
        let path = self.partition_path(&request.partition)?;
        let lock = self.partition_lock(&path);
        let _guard = lock.lock().await;

        let current = self.read_locked(&path).await?;
        let (doomed, remaining): (Vec<&StoredRecord>, Vec<&StoredRecord>) =
            current.iter().partition(|record| matcher.matches(record));
        if doomed.is_empty() {
            return Ok(0);
        }
        let removed = doomed.len();
        let remaining: Vec<StoredRecord> = remaining.into_iter().cloned().collect();

        let written = self.write_partition(&path, remaining).await?;
        self.index.partition_replaced(&request.partition, &written);
        debug!(partition = %request.partition, removed, "bulk delete applied");
        Ok(removed)
    }

    async fn load_partition(&self, partition: &Partition) -> Result<Vec<StoredRecord>> {
        let path = self.partition_path(partition)?;
        Ok(self.read_partition(&path).await?.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use crate::core::error::ErrorKind;
    use crate::core::types::{CachedCollection, ASSETS};

    async fn backend(dir: &TempDir) -> FileBackend {
        let config = Config::with_languages(dir.path(), &["en-us"]);
        FileBackend::open(&config, Arc::new(InMemoryIndex::new())).await.unwrap()
    }

    fn post(uid: &str) -> StoredRecord {
        StoredRecord::new(&Partition::new("post", "en-us"), uid, json!({"uid": uid}))
    }

    #[tokio::test]
    async fn partitions_are_json_arrays_of_records() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend.insert(post("p1")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("en-us/data/post.json")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, json!([{
            "_uid": "p1", "_content_type_uid": "post", "locale": "en-us", "_data": {"uid": "p1"}
        }]));
    }

    #[tokio::test]
    async fn assets_live_under_the_asset_root() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let asset = StoredRecord::new(&Partition::new(ASSETS, "en-us"), "a1", json!({"uid": "a1"}));
        backend.upsert(asset).await.unwrap();

        assert!(dir.path().join("en-us/assets/_assets.json").exists());
        assert!(backend.index.get("en-us", CachedCollection::Assets, "a1").is_some());
    }

    #[tokio::test]
    async fn missing_partitions_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let result = backend
            .find(&Partition::new("nothing", "en-us"), &Map::new(), &FindOptions::default())
            .await
            .unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.count, 0);
    }

    #[tokio::test]
    async fn corrupt_partition_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        std::fs::write(dir.path().join("en-us/data/post.json"), b"{not json").unwrap();

        let err = backend.load_partition(&Partition::new("post", "en-us")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Storage);
    }

    #[tokio::test]
    async fn unknown_locale_fails_before_io() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let err = backend
            .insert(StoredRecord::new(&Partition::new("post", "xx-xx"), "p1", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn second_backend_on_the_same_tree_is_refused() {
        let dir = TempDir::new().unwrap();
        let _first = backend(&dir).await;
        let config = Config::with_languages(dir.path(), &["en-us"]);
        let err = FileBackend::open(&config, Arc::new(InMemoryIndex::new())).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Storage);
    }

    #[tokio::test]
    async fn concurrent_upserts_to_one_partition_all_land() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(backend(&dir).await);

        let writers: Vec<_> = (0..16)
            .map(|n| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move { backend.upsert(post(&format!("p{}", n))).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let stored = backend.load_partition(&Partition::new("post", "en-us")).await.unwrap();
        assert_eq!(stored.len(), 16);
        assert!(backend.cache_stats().hit_count > 0);
    }
}
