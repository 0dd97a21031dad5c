use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::types::{CachedCollection, Partition, StoredRecord, ROUTES};
use crate::index::in_memory::{route_owner, InMemoryIndex};
use crate::query::matcher::DocumentMatcher;
use crate::query::normalizer::{QueryNormalizer, SubQueryRunner};
use crate::query::order::execute;
use crate::query::types::{BulkDelete, BulkInsert, FindOptions, FindResult, Query, RemoveRequest, WriteRequest, UID_KEY};
use crate::resolver::references::{ReferenceFetcher, ReferenceResolver, Seed};
use crate::result::envelope::{Envelope, WriteOperation};
use crate::storage::backend::StorageBackend;
use crate::storage::open_backend;

/// Entry point of the crate: logical reads and writes over the configured backend.
///
/// Reads go through the query normalizer, the backend (or the in-memory index
/// for cached collections) and the reference resolver, and come back as
/// envelopes. Writes go straight to the backend, which keeps the index current.
pub struct ContentStore {
    config: Config,
    index: Arc<InMemoryIndex>,
    backend: Arc<dyn StorageBackend>,
}

impl ContentStore {
    /// Open the configured backend and warm the index from it.
    pub async fn open(config: Config) -> Result<Self> {
        let index = Arc::new(InMemoryIndex::new());
        let backend = open_backend(&config, Arc::clone(&index)).await?;
        let store = Self::with_backend(config, index, backend);
        store.warm_index().await?;
        Ok(store)
    }

    /// Wrap an already opened backend. The index is used as given; call
    /// `warm_index` if it does not mirror the backend yet.
    pub fn with_backend(config: Config, index: Arc<InMemoryIndex>, backend: Arc<dyn StorageBackend>) -> Self {
        ContentStore { config, index, backend }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<InMemoryIndex> {
        &self.index
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Reload routes, schemas and assets of every configured locale.
    pub async fn warm_index(&self) -> Result<()> {
        self.index.clear();
        for locale in self.config.locales() {
            for collection in CachedCollection::ALL {
                let partition = Partition::new(collection.content_type_uid(), locale);
                let records = self.backend.load_partition(&partition).await?;
                self.index.partition_replaced(&partition, &records);
                debug!(partition = %partition, count = records.len(), "index partition loaded");
            }
        }
        info!(locales = self.config.languages.len(), "index warmed");
        Ok(())
    }

    pub async fn find_one(&self, query: Query) -> Result<Envelope> {
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        let result = self.execute(&query, &options).await?;
        if query.raw {
            return Ok(Envelope::Raw(result.records));
        }

        let Some(record) = result.records.into_iter().next() else {
            return Ok(Envelope::single(&query.partition, None));
        };
        let mut payload = record.data;
        if self.resolves_references(&query) {
            let seeds = vec![Seed::root(String::new(), query.content_type_uid(), &record.uid)];
            self.resolve(&mut payload, query.locale(), seeds).await?;
        }
        Ok(Envelope::single(&query.partition, Some(payload)))
    }

    pub async fn find(&self, query: Query, options: FindOptions) -> Result<Envelope> {
        let result = self.execute(&query, &options).await?;
        if query.raw {
            return Ok(Envelope::Raw(result.records));
        }

        let count = query.include_count.then_some(result.count);
        let mut seeds = Vec::with_capacity(result.records.len());
        let mut items = Vec::with_capacity(result.records.len());
        for (position, record) in result.records.into_iter().enumerate() {
            seeds.push(Seed::root(format!("/{}", position), query.content_type_uid(), &record.uid));
            items.push(record.data);
        }

        if !self.resolves_references(&query) || items.is_empty() {
            return Ok(Envelope::many(&query.partition, items, count));
        }
        let mut document = Value::Array(items);
        self.resolve(&mut document, query.locale(), seeds).await?;
        let items = match document {
            Value::Array(items) => items,
            other => vec![other],
        };
        Ok(Envelope::many(&query.partition, items, count))
    }

    pub async fn count(&self, query: Query) -> Result<Envelope> {
        self.config.language(query.locale())?;
        let filter = self.normalize(&query.partition, query.filter).await?;
        let count = match self.cached_records(&query.partition) {
            Some(records) => {
                let matcher = DocumentMatcher::new(&filter)?;
                records.iter().filter(|record| matcher.matches(record)).count()
            }
            None => self.backend.count(&query.partition, &filter).await?,
        };
        Ok(Envelope::Count(count))
    }

    pub async fn insert(&self, request: WriteRequest) -> Result<Envelope> {
        self.config.language(&request.record.locale)?;
        debug!(partition = %request.record.partition(), uid = %request.record.uid, "insert");
        self.backend.insert(request.record).await?;
        Ok(Envelope::written(WriteOperation::Insert, 1))
    }

    pub async fn upsert(&self, request: WriteRequest) -> Result<Envelope> {
        self.config.language(&request.record.locale)?;
        debug!(partition = %request.record.partition(), uid = %request.record.uid, "upsert");
        self.backend.upsert(request.record).await?;
        Ok(Envelope::written(WriteOperation::Upsert, 1))
    }

    pub async fn remove(&self, request: RemoveRequest) -> Result<Envelope> {
        self.config.language(&request.partition.locale)?;
        let removed = self.backend.remove(&request).await?;
        debug!(partition = %request.partition, removed, "remove");
        Ok(Envelope::written(WriteOperation::Remove, removed))
    }

    pub async fn bulk_insert(&self, request: BulkInsert) -> Result<Envelope> {
        self.config.language(&request.partition.locale)?;
        let written = self.backend.bulk_insert(request).await?;
        Ok(Envelope::written(WriteOperation::BulkInsert, written))
    }

    pub async fn bulk_delete(&self, request: BulkDelete) -> Result<Envelope> {
        self.config.language(&request.partition.locale)?;
        let removed = self.backend.bulk_delete(&request).await?;
        Ok(Envelope::written(WriteOperation::BulkDelete, removed))
    }

    /// The entry a URL is routed to, references resolved.
    pub async fn resolve_route(&self, locale: &str, url: &str) -> Result<Option<Value>> {
        let query = Query::new(ROUTES, locale)
            .with_filter("entry.url", Value::String(url.to_string()))
            .without_references();
        let route = self.find_one(query).await?;
        let Some(route) = route.item() else {
            debug!(locale, url, "no route");
            return Ok(None);
        };

        let owner = route_owner(route);
        let uid = route.pointer("/entry/uid").and_then(Value::as_str);
        let (Some(content_type_uid), Some(uid)) = (owner, uid) else {
            debug!(locale, url, "route without an owner");
            return Ok(None);
        };
        let entry = self.find_one(Query::new(content_type_uid, locale).with_uid(uid)).await?;
        Ok(entry.item().cloned())
    }

    fn resolves_references(&self, query: &Query) -> bool {
        query.include_references && query.partition.cached().is_none()
    }

    async fn resolve(&self, document: &mut Value, locale: &str, seeds: Vec<Seed>) -> Result<()> {
        let stats = ReferenceResolver::new(self).resolve(document, locale, seeds).await?;
        if stats.rounds > 0 {
            debug!(
                locale,
                rounds = stats.rounds,
                substituted = stats.substituted,
                cycles_skipped = stats.cycles_skipped,
                "references resolved"
            );
        }
        Ok(())
    }

    async fn normalize(&self, partition: &Partition, filter: Map<String, Value>) -> Result<Map<String, Value>> {
        QueryNormalizer::new(&self.index, self)
            .normalize(&partition.content_type_uid, &partition.locale, filter)
            .await
    }

    /// Snapshot of a cached collection when reads are served from the index.
    fn cached_records(&self, partition: &Partition) -> Option<Vec<StoredRecord>> {
        if !self.config.cache {
            return None;
        }
        partition.cached()?;
        Some(self.index.records(partition).unwrap_or_default())
    }

    async fn execute(&self, query: &Query, options: &FindOptions) -> Result<FindResult> {
        self.config.language(query.locale())?;
        let filter = self.normalize(&query.partition, query.filter.clone()).await?;
        self.find_records(&query.partition, &filter, options).await
    }

    async fn find_records(&self, partition: &Partition, filter: &Map<String, Value>, options: &FindOptions) -> Result<FindResult> {
        match self.cached_records(partition) {
            Some(records) => {
                let matcher = DocumentMatcher::new(filter)?;
                Ok(execute(records.iter(), &matcher, options))
            }
            None => self.backend.find(partition, filter, options).await,
        }
    }
}

#[async_trait]
impl SubQueryRunner for ContentStore {
    async fn matching_uids(&self, content_type_uid: &str, locale: &str, filter: Map<String, Value>) -> Result<Vec<String>> {
        let partition = Partition::new(content_type_uid, locale);
        let filter = self.normalize(&partition, filter).await?;
        let result = self.find_records(&partition, &filter, &FindOptions::default()).await?;
        Ok(result.records.into_iter().map(|record| record.uid).collect())
    }
}

#[async_trait]
impl ReferenceFetcher for ContentStore {
    async fn fetch(&self, content_type_uid: &str, locale: &str, uids: &[String]) -> Result<HashMap<String, Value>> {
        let partition = Partition::new(content_type_uid, locale);
        let mut filter = Map::new();
        filter.insert(UID_KEY.to_string(), json!({ "$in": uids }));
        let result = self.find_records(&partition, &filter, &FindOptions::default()).await?;
        Ok(result
            .records
            .into_iter()
            .map(|record| (record.uid, record.data))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use crate::core::error::ErrorKind;
    use crate::core::types::CONTENT_TYPES;

    async fn store(dir: &TempDir) -> ContentStore {
        ContentStore::open(Config::with_languages(dir.path(), &["en-us"])).await.unwrap()
    }

    async fn seed_blog(store: &ContentStore) {
        store
            .upsert(WriteRequest::new(CONTENT_TYPES, "en-us", "post", json!({
                "uid": "post",
                "schema": [{"uid": "author", "data_type": "reference", "reference_to": "author"}]
            })))
            .await
            .unwrap();
        for (uid, name) in [("a1", "Jo"), ("a2", "Sam")] {
            store
                .insert(WriteRequest::new("author", "en-us", uid, json!({"uid": uid, "name": name})))
                .await
                .unwrap();
        }
        for (uid, author) in [("p1", "a1"), ("p2", "a2")] {
            store
                .insert(WriteRequest::new("post", "en-us", uid, json!({
                    "uid": uid,
                    "author": {"values": author, "_content_type_id": "author"}
                })))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn filters_through_a_reference_field() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        seed_blog(&store).await;

        let query = Query::new("post", "en-us").with_filter("author.name", json!("Sam"));
        let found = store.find(query, FindOptions::default()).await.unwrap();

        assert_eq!(found.items().len(), 1);
        assert_eq!(found.items()[0]["uid"], "p2");
        assert_eq!(found.items()[0]["author"], json!({"uid": "a2", "name": "Sam"}));
    }

    #[tokio::test]
    async fn raw_reads_return_stored_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        seed_blog(&store).await;

        let query = Query::from_value(&json!({
            "_content_type_uid": "post", "locale": "en-us", "_uid": "p1", "_remove": true
        }))
        .unwrap();
        let Envelope::Raw(rows) = store.find_one(query).await.unwrap() else {
            panic!("expected raw rows");
        };
        assert_eq!(rows[0].data["author"]["values"], "a1");
    }

    #[tokio::test]
    async fn routes_lead_to_their_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        seed_blog(&store).await;
        store
            .bulk_insert(
                BulkInsert::new(Partition::new(ROUTES, "en-us"), vec![
                    json!({"entry": {"uid": "p1", "url": "/hello"}, "content_type": {"uid": "post"}}),
                ])
                .unwrap(),
            )
            .await
            .unwrap();

        let entry = store.resolve_route("en-us", "/hello").await.unwrap().unwrap();
        assert_eq!(entry["author"]["name"], "Jo");
        assert_eq!(store.resolve_route("en-us", "/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_locale_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let err = store.count(Query::new("post", "xx-xx")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn reopening_warms_the_index() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir).await;
            seed_blog(&store).await;
        }
        let store = store(&dir).await;
        assert!(store.index().schema("en-us", "post").is_some());
        assert_eq!(store.index().references("en-us", "post").get("author").map(String::as_str), Some("author"));
    }
}
