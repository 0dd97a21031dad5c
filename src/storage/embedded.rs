use std::collections::HashSet;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};
use crate::core::config::{Config, Provider};
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord};
use crate::index::in_memory::InMemoryIndex;
use crate::query::matcher::DocumentMatcher;
use crate::query::order::execute;
use crate::query::types::{BulkDelete, BulkInsert, FindOptions, FindResult, RemoveRequest};
use crate::storage::backend::{cascade_routes, prepare_bulk, prepare_write, validate_partition, StorageBackend};

/// sled-backed store: one tree per locale, records under `<ct>\0<uid>`.
pub struct EmbeddedBackend {
    db: sled::Db,
    index: Arc<InMemoryIndex>,
    locales: HashSet<String>,
}

fn partition_prefix(content_type_uid: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(content_type_uid.len() + 1);
    prefix.extend_from_slice(content_type_uid.as_bytes());
    prefix.push(0);
    prefix
}

fn record_key(content_type_uid: &str, uid: &str) -> Vec<u8> {
    let mut key = partition_prefix(content_type_uid);
    key.extend_from_slice(uid.as_bytes());
    key
}

impl EmbeddedBackend {
    pub async fn open(config: &Config, index: Arc<InMemoryIndex>) -> Result<Self> {
        let path = &config.storage.embedded_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("Creating {}", parent.display()), e))?;
        }

        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|e| Error::storage(format!("Opening {}", path.display()), e))?;

        info!(path = %path.display(), "embedded backend opened");
        Ok(EmbeddedBackend {
            db,
            index,
            locales: config.locales().map(str::to_string).collect(),
        })
    }

    fn tree(&self, partition: &Partition) -> Result<sled::Tree> {
        validate_partition(partition)?;
        if !self.locales.contains(&partition.locale) {
            return Err(Error::invalid_argument(format!(
                "Language '{}' is not configured",
                partition.locale
            )));
        }
        Ok(self.db.open_tree(partition.locale.as_bytes())?)
    }

    fn scan(tree: &sled::Tree, content_type_uid: &str) -> Result<Vec<(sled::IVec, StoredRecord)>> {
        tree.scan_prefix(partition_prefix(content_type_uid))
            .map(|entry| {
                let (key, value) = entry?;
                let record: StoredRecord = serde_json::from_slice(&value)
                    .map_err(|e| Error::storage(format!("Corrupt record under {}", content_type_uid), e))?;
                Ok((key, record))
            })
            .collect()
    }

    async fn flush(tree: &sled::Tree) -> Result<()> {
        tree.flush_async().await?;
        Ok(())
    }

    async fn drop_partition(&self, partition: &Partition) -> Result<usize> {
        let tree = self.tree(partition)?;
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for entry in tree.scan_prefix(partition_prefix(&partition.content_type_uid)).keys() {
            batch.remove(entry?);
            removed += 1;
        }
        tree.apply_batch(batch)?;
        Self::flush(&tree).await?;
        self.index.partition_dropped(partition);
        info!(partition = %partition, removed, "partition dropped");

        cascade_routes(self, partition).await?;
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for EmbeddedBackend {
    fn kind(&self) -> Provider {
        Provider::Embedded
    }

    async fn find(&self, partition: &Partition, filter: &Map<String, Value>, options: &FindOptions) -> Result<FindResult> {
        let matcher = DocumentMatcher::new(filter)?;
        let tree = self.tree(partition)?;
        let records = Self::scan(&tree, &partition.content_type_uid)?;
        Ok(execute(records.iter().map(|(_, record)| record), &matcher, options))
    }

    async fn insert(&self, mut record: StoredRecord) -> Result<()> {
        prepare_write(&mut record)?;
        let tree = self.tree(&record.partition())?;
        let key = record_key(&record.content_type_uid, &record.uid);
        let bytes = serde_json::to_vec(&record)?;

        if tree.compare_and_swap(key, None::<&[u8]>, Some(bytes))?.is_err() {
            return Err(Error::already_exists(format!(
                "{} already holds '{}'",
                record.partition(),
                record.uid
            )));
        }
        Self::flush(&tree).await?;
        self.index.record_written(&record);
        Ok(())
    }

    async fn upsert(&self, mut record: StoredRecord) -> Result<()> {
        prepare_write(&mut record)?;
        let tree = self.tree(&record.partition())?;
        let key = record_key(&record.content_type_uid, &record.uid);
        tree.insert(key, serde_json::to_vec(&record)?)?;
        Self::flush(&tree).await?;
        self.index.record_written(&record);
        Ok(())
    }

    async fn remove(&self, request: &RemoveRequest) -> Result<usize> {
        let Some(uids) = &request.uids else {
            return self.drop_partition(&request.partition).await;
        };

        let tree = self.tree(&request.partition)?;
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for uid in uids {
            let key = record_key(&request.partition.content_type_uid, uid);
            if tree.contains_key(&key)? {
                batch.remove(key);
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(0);
        }
        tree.apply_batch(batch)?;
        Self::flush(&tree).await?;
        self.index.records_removed(&request.partition, uids);
        Ok(removed)
    }

    async fn bulk_insert(&self, mut request: BulkInsert) -> Result<usize> {
        prepare_bulk(&mut request)?;
        let tree = self.tree(&request.partition)?;
        let content_type_uid = &request.partition.content_type_uid;

        // Old keys out and new keys in, applied as one atomic batch.
        let mut batch = sled::Batch::default();
        for key in tree.scan_prefix(partition_prefix(content_type_uid)).keys() {
            batch.remove(key?);
        }
        for record in &request.records {
            batch.insert(record_key(content_type_uid, &record.uid), serde_json::to_vec(record)?);
        }
        tree.apply_batch(batch)?;
        Self::flush(&tree).await?;

        self.index.partition_replaced(&request.partition, &request.records);
        info!(partition = %request.partition, count = request.records.len(), "partition replaced");
        Ok(request.records.len())
    }

    async fn bulk_delete(&self, request: &BulkDelete) -> Result<usize> {
        let matcher = DocumentMatcher::new(&request.to_filter())?;
        let tree = self.tree(&request.partition)?;

        let mut batch = sled::Batch::default();
        let mut removed_uids = Vec::new();
        for (key, record) in Self::scan(&tree, &request.partition.content_type_uid)? {
            if matcher.matches(&record) {
                batch.remove(key);
                removed_uids.push(record.uid);
            }
        }
        if removed_uids.is_empty() {
            return Ok(0);
        }
        tree.apply_batch(batch)?;
        Self::flush(&tree).await?;

        self.index.records_removed(&request.partition, &removed_uids);
        debug!(partition = %request.partition, removed = removed_uids.len(), "bulk delete applied");
        Ok(removed_uids.len())
    }

    async fn load_partition(&self, partition: &Partition) -> Result<Vec<StoredRecord>> {
        let tree = self.tree(partition)?;
        Ok(Self::scan(&tree, &partition.content_type_uid)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use crate::core::types::{CachedCollection, ROUTES};

    async fn backend(dir: &TempDir) -> EmbeddedBackend {
        let config = Config::with_languages(dir.path(), &["en-us", "fr-fr"]);
        EmbeddedBackend::open(&config, Arc::new(InMemoryIndex::new())).await.unwrap()
    }

    #[test]
    fn keys_do_not_bleed_across_content_types() {
        let post = record_key("post", "p1");
        assert!(post.starts_with(&partition_prefix("post")));
        assert!(!post.starts_with(&partition_prefix("pos")));
    }

    #[tokio::test]
    async fn locales_are_separate_trees() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .insert(StoredRecord::new(&Partition::new("post", "en-us"), "p1", json!({"uid": "p1"})))
            .await
            .unwrap();
        backend
            .insert(StoredRecord::new(&Partition::new("post", "fr-fr"), "p1", json!({"uid": "p1"})))
            .await
            .unwrap();

        assert_eq!(backend.load_partition(&Partition::new("post", "en-us")).await.unwrap().len(), 1);
        assert_eq!(backend.load_partition(&Partition::new("post", "fr-fr")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flushed_writes_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let post = Partition::new("post", "en-us");
        {
            let backend = backend(&dir).await;
            backend
                .bulk_insert(BulkInsert::new(post.clone(), vec![json!({"uid": "p1"}), json!({"uid": "p2"})]).unwrap())
                .await
                .unwrap();
            backend.upsert(StoredRecord::new(&post, "p3", json!({"uid": "p3"}))).await.unwrap();
            backend.remove(&RemoveRequest::records("post", "en-us", &["p1"])).await.unwrap();
        }

        let reopened = backend(&dir).await;
        let mut uids: Vec<String> = reopened.load_partition(&post).await.unwrap().into_iter().map(|r| r.uid).collect();
        uids.sort();
        assert_eq!(uids, vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn dropping_a_partition_cascades_to_its_routes() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let routes = Partition::new(ROUTES, "en-us");
        backend
            .bulk_insert(
                BulkInsert::new(routes.clone(), vec![
                    json!({"entry": {"uid": "p1", "url": "/p1"}, "content_type": {"uid": "post"}}),
                    json!({"entry": {"uid": "g1", "url": "/g1"}, "content_type": {"uid": "page"}}),
                ])
                .unwrap(),
            )
            .await
            .unwrap();
        backend
            .insert(StoredRecord::new(&Partition::new("post", "en-us"), "p1", json!({"uid": "p1"})))
            .await
            .unwrap();

        let removed = backend.remove(&RemoveRequest::partition("post", "en-us")).await.unwrap();

        assert_eq!(removed, 1);
        let left = backend.load_partition(&routes).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uid, "g1");
        assert_eq!(backend.index.len("en-us", CachedCollection::Routes), 1);
    }
}
