use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind as DriverErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use crate::core::config::{NetworkedConfig, Provider};
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord, ASSETS, CONTENT_TYPES, ROUTES};
use crate::index::in_memory::InMemoryIndex;
use crate::query::matcher::{DocumentMatcher, LOGICAL_OPERATORS};
use crate::query::types::{BulkDelete, BulkInsert, FindOptions, FindResult, RemoveRequest, SortKey, SortOrder, UID_KEY};
use crate::storage::backend::{cascade_routes, prepare_bulk, prepare_write, validate_partition, StorageBackend};

pub const ENTRIES: &str = "_entries";
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB-backed store. Records live in `_content_types`, `_assets`,
/// `_routes` or `_entries`, unique on `(_content_type_uid, locale, _uid)`.
pub struct NetworkedBackend {
    db: Database,
    index: Arc<InMemoryIndex>,
}

/// Collection holding a content type's records.
pub fn collection_name(content_type_uid: &str) -> &'static str {
    match content_type_uid {
        CONTENT_TYPES => CONTENT_TYPES,
        ASSETS => ASSETS,
        ROUTES => ROUTES,
        _ => ENTRIES,
    }
}

fn physical_path(path: &str) -> String {
    if path == UID_KEY {
        path.to_string()
    } else {
        format!("_data.{}", path)
    }
}

/// Logical filter to a driver filter: payload paths move under `_data.`.
pub fn translate_filter(filter: &Map<String, Value>) -> Result<Document> {
    let mut translated = Document::new();
    for (key, predicate) in filter {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let branches = predicate
                .as_array()
                .ok_or_else(|| Error::invalid_argument(format!("{} expects an array of filters", key)))?
                .iter()
                .map(|branch| {
                    branch
                        .as_object()
                        .ok_or_else(|| Error::invalid_argument(format!("{} branches must be objects", key)))
                        .and_then(translate_filter)
                        .map(Bson::Document)
                })
                .collect::<Result<Vec<_>>>()?;
            translated.insert(key.clone(), Bson::Array(branches));
        } else {
            translated.insert(physical_path(key), bson::to_bson(predicate)?);
        }
    }
    Ok(translated)
}

pub fn translate_sort(keys: &[SortKey]) -> Document {
    let mut sort = Document::new();
    for key in keys {
        let direction = match key.order {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        };
        sort.insert(physical_path(&key.path), direction);
    }
    sort
}

/// Bring a cached partition in line with whatever a failed replacement left
/// in the collection. Without a readable copy the partition is evicted.
fn settle_index(index: &InMemoryIndex, partition: &Partition, reloaded: Result<Vec<StoredRecord>>) {
    match reloaded {
        Ok(records) => index.partition_replaced(partition, &records),
        Err(e) => {
            warn!(partition = %partition, error = %e, "index evicted after failed replace");
            index.partition_dropped(partition);
        }
    }
}

fn scoped(partition: &Partition, mut filter: Document) -> Document {
    filter.insert("_content_type_uid", partition.content_type_uid.as_str());
    filter.insert("locale", partition.locale.as_str());
    filter
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        DriverErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

impl NetworkedBackend {
    pub async fn open(config: &NetworkedConfig, index: Arc<InMemoryIndex>) -> Result<Self> {
        info!(uri = %config.uri, db = %config.db_name, "connecting to document database");
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.server_selection_timeout = Some(Duration::from_millis(config.server_selection_timeout_ms));
        options.app_name = Some("vellum".to_string());

        let client = Client::with_options(options)?;
        let db = client.database(&config.db_name);
        db.run_command(doc! { "ping": 1 }).await?;

        let backend = NetworkedBackend { db, index };
        backend.apply_indexes().await?;
        info!(db = %config.db_name, "networked backend opened");
        Ok(backend)
    }

    async fn apply_indexes(&self) -> Result<()> {
        for name in [CONTENT_TYPES, ASSETS, ROUTES, ENTRIES] {
            let model = IndexModel::builder()
                .keys(doc! { "_content_type_uid": 1, "locale": 1, "_uid": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build();
            self.db.collection::<Document>(name).create_index(model).await?;
        }
        Ok(())
    }

    fn collection(&self, partition: &Partition) -> Result<Collection<Document>> {
        validate_partition(partition)?;
        Ok(self.db.collection(collection_name(&partition.content_type_uid)))
    }

    fn record_filter(record: &StoredRecord) -> Document {
        doc! {
            "_content_type_uid": record.content_type_uid.as_str(),
            "locale": record.locale.as_str(),
            "_uid": record.uid.as_str(),
        }
    }

    async fn fetch(&self, collection: &Collection<Document>, filter: Document, options: Option<&FindOptions>) -> Result<Vec<StoredRecord>> {
        let mut action = collection.find(filter).projection(doc! { "_id": 0 });
        if let Some(options) = options {
            action = action
                .sort(translate_sort(&options.effective_sort()))
                .skip(options.skip as u64);
            if let Some(limit) = options.limit {
                action = action.limit(limit as i64);
            }
        }
        let documents: Vec<Document> = action.await?.try_collect().await?;
        documents
            .into_iter()
            .map(|document| Ok(bson::from_document::<StoredRecord>(document)?))
            .collect()
    }

    async fn drop_partition(&self, partition: &Partition) -> Result<usize> {
        let collection = self.collection(partition)?;
        let deleted = collection.delete_many(scoped(partition, Document::new())).await?;
        self.index.partition_dropped(partition);
        info!(partition = %partition, removed = deleted.deleted_count, "partition dropped");

        cascade_routes(self, partition).await?;
        Ok(deleted.deleted_count as usize)
    }
}

#[async_trait]
impl StorageBackend for NetworkedBackend {
    fn kind(&self) -> Provider {
        Provider::Networked
    }

    async fn find(&self, partition: &Partition, filter: &Map<String, Value>, options: &FindOptions) -> Result<FindResult> {
        DocumentMatcher::new(filter)?;
        let collection = self.collection(partition)?;
        let filter = scoped(partition, translate_filter(filter)?);

        let count = collection.count_documents(filter.clone()).await? as usize;
        let records = self.fetch(&collection, filter, Some(options)).await?;
        Ok(FindResult { records, count })
    }

    async fn count(&self, partition: &Partition, filter: &Map<String, Value>) -> Result<usize> {
        DocumentMatcher::new(filter)?;
        let collection = self.collection(partition)?;
        let filter = scoped(partition, translate_filter(filter)?);
        Ok(collection.count_documents(filter).await? as usize)
    }

    async fn insert(&self, mut record: StoredRecord) -> Result<()> {
        prepare_write(&mut record)?;
        let collection = self.collection(&record.partition())?;
        match collection.insert_one(bson::to_document(&record)?).await {
            Ok(_) => {}
            Err(e) if is_duplicate_key(&e) => {
                return Err(Error::already_exists(format!(
                    "{} already holds '{}'",
                    record.partition(),
                    record.uid
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.index.record_written(&record);
        Ok(())
    }

    async fn upsert(&self, mut record: StoredRecord) -> Result<()> {
        prepare_write(&mut record)?;
        let collection = self.collection(&record.partition())?;
        collection
            .replace_one(Self::record_filter(&record), bson::to_document(&record)?)
            .upsert(true)
            .await?;
        self.index.record_written(&record);
        Ok(())
    }

    async fn remove(&self, request: &RemoveRequest) -> Result<usize> {
        let Some(uids) = &request.uids else {
            return self.drop_partition(&request.partition).await;
        };
        let collection = self.collection(&request.partition)?;
        let filter = scoped(&request.partition, doc! { "_uid": { "$in": uids.clone() } });
        let deleted = collection.delete_many(filter).await?;
        self.index.records_removed(&request.partition, uids);
        Ok(deleted.deleted_count as usize)
    }

    async fn bulk_insert(&self, mut request: BulkInsert) -> Result<usize> {
        prepare_bulk(&mut request)?;
        let collection = self.collection(&request.partition)?;

        let documents = request
            .records
            .iter()
            .map(bson::to_document)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Not atomic: a failure between the two calls leaves the partition
        // half-replaced until the next full sync.
        collection.delete_many(scoped(&request.partition, Document::new())).await?;
        if !documents.is_empty() {
            if let Err(e) = collection.insert_many(documents).await {
                if request.partition.cached().is_some() {
                    let reloaded = self.load_partition(&request.partition).await;
                    settle_index(&self.index, &request.partition, reloaded);
                }
                return Err(e.into());
            }
        }

        self.index.partition_replaced(&request.partition, &request.records);
        info!(partition = %request.partition, count = request.records.len(), "partition replaced");
        Ok(request.records.len())
    }

    async fn bulk_delete(&self, request: &BulkDelete) -> Result<usize> {
        let collection = self.collection(&request.partition)?;
        let filter = scoped(&request.partition, translate_filter(&request.to_filter())?);
        let deleted = collection.delete_many(filter).await?;

        if request.partition.cached().is_some() && deleted.deleted_count > 0 {
            let remaining = self.load_partition(&request.partition).await?;
            self.index.partition_replaced(&request.partition, &remaining);
        }
        debug!(partition = %request.partition, removed = deleted.deleted_count, "bulk delete applied");
        Ok(deleted.deleted_count as usize)
    }

    async fn load_partition(&self, partition: &Partition) -> Result<Vec<StoredRecord>> {
        let collection = self.collection(partition)?;
        self.fetch(&collection, scoped(partition, Document::new()), None).await
    }
}
