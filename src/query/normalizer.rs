use std::collections::BTreeMap;
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::CachedCollection;
use crate::index::in_memory::InMemoryIndex;
use crate::query::matcher::LOGICAL_OPERATORS;
use crate::schema::markers::VALUES_KEY;

/// Runs the sub-queries a reference predicate expands into.
#[async_trait]
pub trait SubQueryRunner: Send + Sync {
    /// Uids of `content_type_uid` records in `locale` matching a logical filter.
    async fn matching_uids(
        &self,
        content_type_uid: &str,
        locale: &str,
        filter: Map<String, Value>,
    ) -> Result<Vec<String>>;
}

/// Rewrites predicates on reference fields into predicates on the stored
/// placeholder. `author.uid` becomes `author.values`, which itself passes
/// through unchanged. `author.name` runs a sub-query against the referenced
/// content type and becomes `author.values: {$in: [matching uids]}`.
pub struct QueryNormalizer<'a> {
    index: &'a InMemoryIndex,
    runner: &'a dyn SubQueryRunner,
}

impl<'a> QueryNormalizer<'a> {
    pub fn new(index: &'a InMemoryIndex, runner: &'a dyn SubQueryRunner) -> Self {
        QueryNormalizer { index, runner }
    }

    pub fn normalize<'b>(
        &'b self,
        content_type_uid: &'b str,
        locale: &'b str,
        filter: Map<String, Value>,
    ) -> BoxFuture<'b, Result<Map<String, Value>>> {
        async move {
            if filter.is_empty() || CachedCollection::of(content_type_uid).is_some() {
                return Ok(filter);
            }
            let references: BTreeMap<String, String> = self
                .index
                .references(locale, content_type_uid)
                .into_iter()
                .map(|(path, target)| (path.replace(':', "."), target))
                .collect();
            if references.is_empty() {
                return Ok(filter);
            }

            let rewrites = filter.into_iter().map(|(key, predicate)| {
                self.normalize_entry(content_type_uid, locale, &references, key, predicate)
            });
            let rewritten = try_join_all(rewrites).await?;

            let mut normalized = Map::new();
            for (key, predicate) in rewritten {
                merge_at_key(&mut normalized, key, predicate);
            }
            Ok(normalized)
        }
        .boxed()
    }

    async fn normalize_entry(
        &self,
        content_type_uid: &str,
        locale: &str,
        references: &BTreeMap<String, String>,
        key: String,
        predicate: Value,
    ) -> Result<(String, Value)> {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let Value::Array(branches) = predicate else {
                return Err(Error::invalid_argument(format!("{} expects an array of filters", key)));
            };
            let operator = key.as_str();
            let rewrites = branches.into_iter().map(|branch| async move {
                match branch {
                    Value::Object(branch) => Ok(Value::Object(
                        self.normalize(content_type_uid, locale, branch).await?,
                    )),
                    _ => Err(Error::invalid_argument(format!("{} branches must be objects", operator))),
                }
            });
            let branches = try_join_all(rewrites).await?;
            return Ok((key, Value::Array(branches)));
        }

        let Some((path, target)) = reference_prefix(references, &key) else {
            return Ok((key, predicate));
        };
        let embedded = format!("{}.{}", path, VALUES_KEY);
        let rest = key[path.len()..].trim_start_matches('.');
        if rest.is_empty() || rest == "uid" || rest == VALUES_KEY {
            return Ok((embedded, predicate));
        }

        let mut sub_filter = Map::new();
        sub_filter.insert(rest.to_string(), predicate);
        let uids = self.runner.matching_uids(target, locale, sub_filter).await?;
        debug!(
            content_type = content_type_uid,
            reference = %path,
            target = %target,
            count = uids.len(),
            "reference predicate resolved"
        );
        Ok((embedded, json!({ "$in": uids })))
    }
}

/// Longest reference path that `key` equals or extends.
fn reference_prefix<'r>(references: &'r BTreeMap<String, String>, key: &str) -> Option<(&'r str, &'r str)> {
    references
        .iter()
        .filter(|(path, _)| {
            key == path.as_str()
                || (key.starts_with(path.as_str()) && key.as_bytes().get(path.len()) == Some(&b'.'))
        })
        .max_by_key(|(path, _)| path.len())
        .map(|(path, target)| (path.as_str(), target.as_str()))
}

// Two predicates landing on the same key must both hold.
fn merge_at_key(filter: &mut Map<String, Value>, key: String, predicate: Value) {
    if !filter.contains_key(&key) {
        filter.insert(key, predicate);
        return;
    }
    let clause = json!({ key.as_str(): predicate });
    match filter.get_mut("$and") {
        Some(Value::Array(clauses)) => clauses.push(clause),
        _ => {
            filter.insert("$and".to_string(), Value::Array(vec![clause]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use crate::core::types::{Partition, StoredRecord, CONTENT_TYPES};

    struct Recorded {
        calls: Mutex<Vec<(String, Value)>>,
        uids: Vec<String>,
    }

    #[async_trait]
    impl SubQueryRunner for Recorded {
        async fn matching_uids(&self, content_type_uid: &str, _locale: &str, filter: Map<String, Value>) -> Result<Vec<String>> {
            self.calls.lock().push((content_type_uid.to_string(), Value::Object(filter)));
            Ok(self.uids.clone())
        }
    }

    fn index_with_post_schema() -> InMemoryIndex {
        let index = InMemoryIndex::new();
        index.record_written(&StoredRecord::new(
            &Partition::new(CONTENT_TYPES, "en-us"),
            "post",
            json!({"uid": "post", "references": {"author": "author", "seo:related": "post"}}),
        ));
        index
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn uid_predicates_point_at_the_placeholder() {
        let index = index_with_post_schema();
        let runner = Recorded { calls: Mutex::new(Vec::new()), uids: Vec::new() };
        let normalizer = QueryNormalizer::new(&index, &runner);

        let filter = normalizer
            .normalize("post", "en-us", object(json!({"author.uid": "a1", "title": "Hi"})))
            .await
            .unwrap();

        assert_eq!(Value::Object(filter), json!({"author.values": "a1", "title": "Hi"}));
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn placeholder_paths_are_kept_as_written() {
        let index = index_with_post_schema();
        let runner = Recorded { calls: Mutex::new(Vec::new()), uids: Vec::new() };
        let normalizer = QueryNormalizer::new(&index, &runner);

        let filter = normalizer
            .normalize("post", "en-us", object(json!({"author.values": {"$in": ["a1", "a2"]}})))
            .await
            .unwrap();

        assert_eq!(Value::Object(filter), json!({"author.values": {"$in": ["a1", "a2"]}}));
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn field_predicates_become_sub_queries() {
        let index = index_with_post_schema();
        let runner = Recorded { calls: Mutex::new(Vec::new()), uids: vec!["a1".into(), "a2".into()] };
        let normalizer = QueryNormalizer::new(&index, &runner);

        let filter = normalizer
            .normalize("post", "en-us", object(json!({
                "$or": [{"author.name": "Jo"}, {"seo.related.title": {"$regex": "^Intro"}}]
            })))
            .await
            .unwrap();

        assert_eq!(Value::Object(filter), json!({"$or": [
            {"author.values": {"$in": ["a1", "a2"]}},
            {"seo.related.values": {"$in": ["a1", "a2"]}}
        ]}));
        let calls = runner.calls.lock();
        assert!(calls.contains(&("author".to_string(), json!({"name": "Jo"}))));
        assert!(calls.contains(&("post".to_string(), json!({"title": {"$regex": "^Intro"}}))));
    }

    #[tokio::test]
    async fn same_key_results_are_anded() {
        let index = index_with_post_schema();
        let runner = Recorded { calls: Mutex::new(Vec::new()), uids: vec!["a1".into()] };
        let normalizer = QueryNormalizer::new(&index, &runner);

        let filter = normalizer
            .normalize("post", "en-us", object(json!({"author.name": "Jo", "author.age": 30})))
            .await
            .unwrap();

        assert_eq!(filter["author.values"], json!({"$in": ["a1"]}));
        assert_eq!(filter["$and"], json!([{"author.values": {"$in": ["a1"]}}]));
    }

    #[tokio::test]
    async fn lookalike_keys_pass_through() {
        let index = index_with_post_schema();
        let runner = Recorded { calls: Mutex::new(Vec::new()), uids: Vec::new() };
        let normalizer = QueryNormalizer::new(&index, &runner);

        let filter = normalizer
            .normalize("post", "en-us", object(json!({"authorship": "x"})))
            .await
            .unwrap();
        assert_eq!(Value::Object(filter), json!({"authorship": "x"}));
    }
}
