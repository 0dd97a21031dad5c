use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use crate::core::config::Provider;
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord, CONTENT_TYPES, ROUTES};
use crate::query::types::{BulkDelete, BulkInsert, FindOptions, FindResult, RemoveRequest};
use crate::schema::schema::attach_references;

/// The operation set every storage provider implements.
///
/// Filters arrive already normalized (reference predicates rewritten) and are
/// relative to the payload, with `_uid` addressing the record uid. Backends
/// keep the in-memory index in step with every durable write to a cached
/// collection before returning.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> Provider;

    /// Matching records, sorted (default `published_at` descending, ties on `_uid`) and paged;
    /// `count` is the size of the full match set.
    async fn find(&self, partition: &Partition, filter: &Map<String, Value>, options: &FindOptions) -> Result<FindResult>;

    async fn find_one(&self, partition: &Partition, filter: &Map<String, Value>) -> Result<Option<StoredRecord>> {
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        let result = self.find(partition, filter, &options).await?;
        Ok(result.records.into_iter().next())
    }

    async fn count(&self, partition: &Partition, filter: &Map<String, Value>) -> Result<usize> {
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        Ok(self.find(partition, filter, &options).await?.count)
    }

    /// Fails with `AlreadyExists` when the uid is already stored in the partition.
    async fn insert(&self, record: StoredRecord) -> Result<()>;

    async fn upsert(&self, record: StoredRecord) -> Result<()>;

    /// Number of records removed. Dropping a whole partition also drops the
    /// routes owned by its content type.
    async fn remove(&self, request: &RemoveRequest) -> Result<usize>;

    /// Replace the partition contents.
    async fn bulk_insert(&self, request: BulkInsert) -> Result<usize>;

    async fn bulk_delete(&self, request: &BulkDelete) -> Result<usize>;

    /// Every stored record of a partition, in storage order.
    async fn load_partition(&self, partition: &Partition) -> Result<Vec<StoredRecord>>;
}

/// Shared write preparation: payloads must be objects, and schema writes carry
/// freshly computed `references`.
pub fn prepare_write(record: &mut StoredRecord) -> Result<()> {
    if !record.data.is_object() {
        return Err(Error::invalid_argument(format!(
            "Payload of {}/{} must be a JSON object",
            record.partition(),
            record.uid
        )));
    }
    if record.content_type_uid == CONTENT_TYPES {
        attach_references(&mut record.data)?;
    }
    Ok(())
}

pub fn prepare_bulk(request: &mut BulkInsert) -> Result<()> {
    request.records.iter_mut().try_for_each(prepare_write)
}

/// Content type uids become file names and keys; keep them to a single path segment.
pub fn validate_partition(partition: &Partition) -> Result<()> {
    let ct = &partition.content_type_uid;
    let bad = |value: &str| value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\', '\0']);
    if bad(ct.as_str()) || bad(partition.locale.as_str()) {
        return Err(Error::invalid_argument(format!("Invalid partition {}", partition)));
    }
    Ok(())
}

/// Drop the routes owned by a removed content type.
pub async fn cascade_routes<B>(backend: &B, partition: &Partition) -> Result<usize>
where
    B: StorageBackend + ?Sized,
{
    if partition.cached().is_some() {
        return Ok(0);
    }
    let routes = BulkDelete::new(
        Partition::new(ROUTES, partition.locale.clone()),
        "content_type.uid",
        vec![Value::String(partition.content_type_uid.clone())],
    );
    let removed = backend.bulk_delete(&routes).await?;
    debug!(partition = %partition, removed, "routes cascaded");
    Ok(removed)
}
