use std::collections::{BTreeMap, HashMap};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use crate::core::types::{CachedCollection, Partition, StoredRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    locale: String,
    collection: CachedCollection,
}

/// Process-wide mirror of `_routes`, `_assets` and `_content_types`, per locale.
///
/// Only storage backends mutate it, after their durable write has succeeded.
/// Every mutation runs inside a single write-lock scope, so readers observe
/// either the old or the new partition, never a mix.
pub struct InMemoryIndex {
    collections: RwLock<HashMap<IndexKey, BTreeMap<String, StoredRecord>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        InMemoryIndex {
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn key_of(partition: &Partition) -> Option<IndexKey> {
        partition.cached().map(|collection| IndexKey {
            locale: partition.locale.clone(),
            collection,
        })
    }

    pub fn get(&self, locale: &str, collection: CachedCollection, uid: &str) -> Option<StoredRecord> {
        let key = IndexKey { locale: locale.to_string(), collection };
        self.collections
            .read()
            .get(&key)
            .and_then(|records| records.get(uid))
            .cloned()
    }

    /// Snapshot of a cached partition, or `None` when the partition is not cached.
    pub fn records(&self, partition: &Partition) -> Option<Vec<StoredRecord>> {
        let key = Self::key_of(partition)?;
        let collections = self.collections.read();
        Some(
            collections
                .get(&key)
                .map(|records| records.values().cloned().collect())
                .unwrap_or_default(),
        )
    }

    pub fn len(&self, locale: &str, collection: CachedCollection) -> usize {
        let key = IndexKey { locale: locale.to_string(), collection };
        self.collections.read().get(&key).map_or(0, BTreeMap::len)
    }

    pub fn record_written(&self, record: &StoredRecord) {
        let Some(key) = Self::key_of(&record.partition()) else {
            return;
        };
        self.collections
            .write()
            .entry(key)
            .or_default()
            .insert(record.uid.clone(), record.clone());
    }

    pub fn partition_replaced(&self, partition: &Partition, records: &[StoredRecord]) {
        let Some(key) = Self::key_of(partition) else {
            return;
        };
        let fresh: BTreeMap<String, StoredRecord> = records
            .iter()
            .map(|record| (record.uid.clone(), record.clone()))
            .collect();
        debug!(partition = %partition, count = fresh.len(), "index partition replaced");
        self.collections.write().insert(key, fresh);
    }

    pub fn records_removed(&self, partition: &Partition, uids: &[String]) {
        let Some(key) = Self::key_of(partition) else {
            return;
        };
        let mut collections = self.collections.write();
        if let Some(records) = collections.get_mut(&key) {
            for uid in uids {
                records.remove(uid);
            }
        }
    }

    pub fn partition_dropped(&self, partition: &Partition) {
        if let Some(key) = Self::key_of(partition) {
            self.collections.write().remove(&key);
        }
    }

    pub fn schema(&self, locale: &str, content_type_uid: &str) -> Option<Value> {
        self.get(locale, CachedCollection::Schemas, content_type_uid)
            .map(|record| record.data)
    }

    /// `references` of a content type's schema; empty when the schema is unknown.
    pub fn references(&self, locale: &str, content_type_uid: &str) -> BTreeMap<String, String> {
        let key = IndexKey { locale: locale.to_string(), collection: CachedCollection::Schemas };
        self.collections
            .read()
            .get(&key)
            .and_then(|schemas| schemas.get(content_type_uid))
            .and_then(|schema| schema.data.get("references"))
            .and_then(Value::as_object)
            .map(|references| {
                references
                    .iter()
                    .filter_map(|(path, target)| Some((path.clone(), target.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.collections.write().clear();
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Content type a route payload points at.
pub fn route_owner(route: &Value) -> Option<&str> {
    route
        .get("content_type")
        .and_then(|content_type| content_type.get("uid"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::core::types::{ASSETS, CONTENT_TYPES, ROUTES};

    fn route(uid: &str, owner: &str, locale: &str) -> StoredRecord {
        StoredRecord::new(
            &Partition::new(ROUTES, locale),
            uid,
            json!({"entry": {"uid": uid, "url": format!("/{}", uid)}, "content_type": {"uid": owner}}),
        )
    }

    #[test]
    fn uncached_partitions_are_ignored() {
        let index = InMemoryIndex::new();
        let post = Partition::new("post", "en-us");
        index.record_written(&StoredRecord::new(&post, "p1", json!({"uid": "p1"})));

        assert!(index.records(&post).is_none());
        assert_eq!(index.len("en-us", CachedCollection::Assets), 0);
    }

    #[test]
    fn writes_and_replacements_are_visible() {
        let index = InMemoryIndex::new();
        let assets = Partition::new(ASSETS, "en-us");
        index.record_written(&StoredRecord::new(&assets, "a1", json!({"uid": "a1", "v": 1})));
        index.record_written(&StoredRecord::new(&assets, "a1", json!({"uid": "a1", "v": 2})));
        assert_eq!(index.get("en-us", CachedCollection::Assets, "a1").unwrap().data["v"], 2);

        index.partition_replaced(&assets, &[StoredRecord::new(&assets, "a2", json!({"uid": "a2"}))]);
        assert!(index.get("en-us", CachedCollection::Assets, "a1").is_none());
        assert_eq!(index.len("en-us", CachedCollection::Assets), 1);

        // Locales are isolated.
        assert_eq!(index.len("fr-fr", CachedCollection::Assets), 0);
    }

    #[test]
    fn removed_routes_leave_the_index() {
        let index = InMemoryIndex::new();
        index.record_written(&route("p1", "post", "en-us"));
        index.record_written(&route("g1", "page", "en-us"));

        index.records_removed(&Partition::new(ROUTES, "en-us"), &["p1".to_string()]);
        assert!(index.get("en-us", CachedCollection::Routes, "p1").is_none());
        let left = index.get("en-us", CachedCollection::Routes, "g1").unwrap();
        assert_eq!(route_owner(&left.data), Some("page"));
        assert_eq!(index.len("en-us", CachedCollection::Routes), 1);
    }

    #[test]
    fn references_come_from_the_cached_schema() {
        let index = InMemoryIndex::new();
        let schemas = Partition::new(CONTENT_TYPES, "en-us");
        index.record_written(&StoredRecord::new(
            &schemas,
            "post",
            json!({"uid": "post", "references": {"author": "author"}}),
        ));

        assert_eq!(index.references("en-us", "post")["author"], "author");
        assert!(index.references("en-us", "page").is_empty());
        index.partition_dropped(&schemas);
        assert!(index.schema("en-us", "post").is_none());
    }
}
