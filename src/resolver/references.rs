use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::ASSETS;
use crate::schema::markers::{is_placeholder, CONTENT_TYPE_MARKER, VALUES_KEY};

/// Loads referenced payloads for the resolver. Missing uids are simply absent
/// from the returned map.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(
        &self,
        content_type_uid: &str,
        locale: &str,
        uids: &[String],
    ) -> Result<HashMap<String, Value>>;
}

/// `(content type, uid)` of an entry on the expansion path.
pub type NodeId = (String, String);

/// Subtree still to be scanned, with the chain of entries that embed it.
#[derive(Debug, Clone)]
pub struct Seed {
    pub pointer: String,
    pub ancestors: Arc<Vec<NodeId>>,
}

impl Seed {
    pub fn root(pointer: String, content_type_uid: &str, uid: &str) -> Self {
        Seed {
            pointer,
            ancestors: Arc::new(vec![(content_type_uid.to_string(), uid.to_string())]),
        }
    }
}

#[derive(Debug)]
struct Pending {
    pointer: String,
    content_type_uid: String,
    uids: Vec<String>,
    single: bool,
    ancestors: Arc<Vec<NodeId>>,
}

/// Resolution statistics, mostly for logs and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveStats {
    pub rounds: usize,
    pub substituted: usize,
    pub cycles_skipped: usize,
}

/// Replaces `{values, _content_type_id}` placeholders with the records they
/// name, round by round, until a walk finds nothing left to fetch.
///
/// Each round scans only the subtrees substituted by the previous one. A
/// candidate whose `(content type, uid)` already appears in the chain of
/// entries embedding the placeholder is dropped, so `A -> B -> A` stops at B
/// with an empty edge. Assets are substituted but never scanned further.
pub struct ReferenceResolver<'a> {
    fetcher: &'a dyn ReferenceFetcher,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(fetcher: &'a dyn ReferenceFetcher) -> Self {
        ReferenceResolver { fetcher }
    }

    pub async fn resolve(&self, document: &mut Value, locale: &str, seeds: Vec<Seed>) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();
        let mut frontier = seeds;

        while !frontier.is_empty() {
            let mut pending = Vec::new();
            for seed in &frontier {
                if let Some(node) = document.pointer(&seed.pointer) {
                    collect_placeholders(node, &seed.pointer, &seed.ancestors, &mut pending, &mut stats);
                }
            }
            if pending.is_empty() {
                break;
            }
            stats.rounds += 1;

            let mut wanted: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
            for task in &pending {
                let uids = wanted.entry(task.content_type_uid.as_str()).or_default();
                uids.extend(task.uids.iter().map(String::as_str));
            }
            let fetches = wanted
                .into_iter()
                .filter(|(_, uids)| !uids.is_empty())
                .map(|(content_type_uid, uids)| async move {
                    let uids: Vec<String> = uids.into_iter().map(str::to_string).collect();
                    let found = self.fetcher.fetch(content_type_uid, locale, &uids).await?;
                    Ok::<_, Error>((content_type_uid.to_string(), found))
                });
            let fetched: HashMap<String, HashMap<String, Value>> =
                try_join_all(fetches).await?.into_iter().collect();

            frontier = Vec::new();
            for task in pending {
                let records = fetched.get(&task.content_type_uid);
                let found: Vec<(String, Value)> = task
                    .uids
                    .iter()
                    .filter_map(|uid| Some((uid.clone(), records?.get(uid)?.clone())))
                    .collect();
                stats.substituted += found.len();

                let descend = task.content_type_uid != ASSETS;
                let child = |pointer: String, uid: &str| {
                    let mut chain = task.ancestors.as_ref().clone();
                    chain.push((task.content_type_uid.clone(), uid.to_string()));
                    Seed { pointer, ancestors: Arc::new(chain) }
                };

                let replacement = if task.single {
                    match found.into_iter().next() {
                        Some((uid, payload)) => {
                            if descend {
                                frontier.push(child(task.pointer.clone(), &uid));
                            }
                            payload
                        }
                        None => Value::Null,
                    }
                } else {
                    let mut items = Vec::with_capacity(found.len());
                    for (position, (uid, payload)) in found.into_iter().enumerate() {
                        if descend {
                            frontier.push(child(format!("{}/{}", task.pointer, position), &uid));
                        }
                        items.push(payload);
                    }
                    Value::Array(items)
                };

                if let Some(slot) = document.pointer_mut(&task.pointer) {
                    *slot = replacement;
                }
            }
        }

        Ok(stats)
    }
}

fn collect_placeholders(
    node: &Value,
    pointer: &str,
    ancestors: &Arc<Vec<NodeId>>,
    pending: &mut Vec<Pending>,
    stats: &mut ResolveStats,
) {
    match node {
        Value::Object(object) if is_placeholder(node) => {
            let content_type_uid = object
                .get(CONTENT_TYPE_MARKER)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (single, candidates) = match object.get(VALUES_KEY) {
                Some(Value::String(uid)) => (true, vec![uid.clone()]),
                Some(Value::Array(items)) => (
                    false,
                    items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
                ),
                _ => (false, Vec::new()),
            };

            let mut uids = Vec::with_capacity(candidates.len());
            for uid in candidates {
                let closes_cycle = ancestors
                    .iter()
                    .any(|(ancestor_ct, ancestor_uid)| *ancestor_ct == content_type_uid && *ancestor_uid == uid);
                if closes_cycle {
                    stats.cycles_skipped += 1;
                    debug!(content_type = %content_type_uid, uid = %uid, at = pointer, "cyclic reference skipped");
                } else {
                    uids.push(uid);
                }
            }

            pending.push(Pending {
                pointer: pointer.to_string(),
                content_type_uid,
                uids,
                single,
                ancestors: Arc::clone(ancestors),
            });
        }
        Value::Object(object) => {
            for (key, child) in object {
                let child_pointer = format!("{}/{}", pointer, escape_token(key));
                collect_placeholders(child, &child_pointer, ancestors, pending, stats);
            }
        }
        Value::Array(items) => {
            for (position, child) in items.iter().enumerate() {
                let child_pointer = format!("{}/{}", pointer, position);
                collect_placeholders(child, &child_pointer, ancestors, pending, stats);
            }
        }
        _ => {}
    }
}

// RFC 6901 token escaping.
fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use crate::core::error::ErrorKind;

    struct Fixtures {
        records: HashMap<(String, String), Value>,
        calls: Mutex<usize>,
        fail_on: Option<String>,
    }

    impl Fixtures {
        fn new(records: Vec<(&str, &str, Value)>) -> Self {
            Fixtures {
                records: records
                    .into_iter()
                    .map(|(ct, uid, payload)| ((ct.to_string(), uid.to_string()), payload))
                    .collect(),
                calls: Mutex::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl ReferenceFetcher for Fixtures {
        async fn fetch(&self, content_type_uid: &str, _locale: &str, uids: &[String]) -> Result<HashMap<String, Value>> {
            *self.calls.lock() += 1;
            if self.fail_on.as_deref() == Some(content_type_uid) {
                return Err(Error::storage("fetch", std::io::Error::other("disk gone")));
            }
            Ok(uids
                .iter()
                .filter_map(|uid| {
                    let payload = self.records.get(&(content_type_uid.to_string(), uid.clone()))?;
                    Some((uid.clone(), payload.clone()))
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn single_reference_becomes_the_record() {
        let fetcher = Fixtures::new(vec![("author", "a1", json!({"uid": "a1", "name": "Jo"}))]);
        let mut entry = json!({"uid": "p1", "author": {"values": "a1", "_content_type_id": "author"}});

        let stats = ReferenceResolver::new(&fetcher)
            .resolve(&mut entry, "en-us", vec![Seed::root(String::new(), "post", "p1")])
            .await
            .unwrap();

        assert_eq!(entry["author"], json!({"uid": "a1", "name": "Jo"}));
        assert_eq!(stats.substituted, 1);
    }

    #[tokio::test]
    async fn mutual_references_terminate_with_an_empty_edge() {
        let fetcher = Fixtures::new(vec![
            ("a", "x", json!({"uid": "x", "peer": {"values": ["y"], "_content_type_id": "b"}})),
            ("b", "y", json!({"uid": "y", "peer": {"values": ["x"], "_content_type_id": "a"}})),
        ]);
        let mut entry = json!({"uid": "x", "peer": {"values": ["y"], "_content_type_id": "b"}});

        let stats = ReferenceResolver::new(&fetcher)
            .resolve(&mut entry, "en-us", vec![Seed::root(String::new(), "a", "x")])
            .await
            .unwrap();

        assert_eq!(entry["peer"][0]["uid"], "y");
        assert_eq!(entry["peer"][0]["peer"], json!([]));
        assert_eq!(stats.cycles_skipped, 1);
    }

    #[tokio::test]
    async fn same_uid_in_another_content_type_is_not_a_cycle() {
        let fetcher = Fixtures::new(vec![("author", "x", json!({"uid": "x", "name": "Sam"}))]);
        let mut entry = json!({"uid": "x", "author": {"values": "x", "_content_type_id": "author"}});

        ReferenceResolver::new(&fetcher)
            .resolve(&mut entry, "en-us", vec![Seed::root(String::new(), "post", "x")])
            .await
            .unwrap();
        assert_eq!(entry["author"]["name"], "Sam");
    }

    #[tokio::test]
    async fn arrays_keep_uid_order_and_drop_missing() {
        let fetcher = Fixtures::new(vec![
            ("tag", "t1", json!({"uid": "t1"})),
            ("tag", "t3", json!({"uid": "t3"})),
        ]);
        let mut entries = json!([
            {"uid": "p1", "tags": {"values": ["t3", "t2", "t1"], "_content_type_id": "tag"}},
            {"uid": "p2", "tags": {"values": ["t1"], "_content_type_id": "tag"}}
        ]);
        let seeds = vec![
            Seed::root("/0".to_string(), "post", "p1"),
            Seed::root("/1".to_string(), "post", "p2"),
        ];

        ReferenceResolver::new(&fetcher).resolve(&mut entries, "en-us", seeds).await.unwrap();

        assert_eq!(entries[0]["tags"], json!([{"uid": "t3"}, {"uid": "t1"}]));
        assert_eq!(entries[1]["tags"], json!([{"uid": "t1"}]));
        // Both placeholders were served by one batched fetch.
        assert_eq!(*fetcher.calls.lock(), 1);
    }

    #[tokio::test]
    async fn nested_references_resolve_over_several_rounds() {
        let fetcher = Fixtures::new(vec![
            ("author", "a1", json!({"uid": "a1", "avatar": {"values": "img", "_content_type_id": "_assets"}})),
            ("_assets", "img", json!({"uid": "img", "url": "/assets/img/a.png"})),
        ]);
        let mut entry = json!({
            "uid": "p1",
            "blocks": [{"by": {"values": "a1", "_content_type_id": "author"}}]
        });

        let stats = ReferenceResolver::new(&fetcher)
            .resolve(&mut entry, "en-us", vec![Seed::root(String::new(), "post", "p1")])
            .await
            .unwrap();

        assert_eq!(entry["blocks"][0]["by"]["avatar"]["url"], "/assets/img/a.png");
        assert_eq!(stats.rounds, 2);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_resolution() {
        let mut fetcher = Fixtures::new(Vec::new());
        fetcher.fail_on = Some("author".to_string());
        let mut entry = json!({"author": {"values": "a1", "_content_type_id": "author"}});

        let err = ReferenceResolver::new(&fetcher)
            .resolve(&mut entry, "en-us", vec![Seed::root(String::new(), "post", "p1")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Storage);
    }
}
