use serde_json::{json, Value};
use tempfile::TempDir;
use vellum::core::config::Config;
use vellum::core::store::ContentStore;
use vellum::core::types::{ASSETS, CONTENT_TYPES};
use vellum::query::types::{FindOptions, Query, WriteRequest};
use vellum::schema::markers::{mark_references, prepare_entry};
use vellum::schema::schema::{ContentTypeSchema, FieldDefinition};

const LOCALE: &str = "en-us";

async fn open(dir: &TempDir) -> ContentStore {
    ContentStore::open(Config::with_languages(dir.path(), &[LOCALE])).await.unwrap()
}

async fn define(store: &ContentStore, schema: ContentTypeSchema) {
    let uid = schema.uid.clone();
    store
        .upsert(WriteRequest::new(CONTENT_TYPES, LOCALE, &uid, schema.to_payload().unwrap()))
        .await
        .unwrap();
}

async fn put(store: &ContentStore, content_type_uid: &str, data: Value) {
    let uid = data["uid"].as_str().unwrap().to_string();
    store.upsert(WriteRequest::new(content_type_uid, LOCALE, &uid, data)).await.unwrap();
}

async fn blog(store: &ContentStore) {
    define(store, ContentTypeSchema::new("company", vec![FieldDefinition::text("name")])).await;
    define(store, ContentTypeSchema::new("author", vec![
        FieldDefinition::text("name"),
        FieldDefinition::reference("employer", "company", false),
    ]))
    .await;
    define(store, ContentTypeSchema::new("post", vec![
        FieldDefinition::text("title"),
        FieldDefinition::reference("authors", "author", true),
        FieldDefinition::file("hero", false),
        FieldDefinition::group("related", false, vec![FieldDefinition::reference("posts", "post", true)]),
    ]))
    .await;

    put(store, "company", json!({"uid": "c1", "name": "Acme"})).await;
    put(store, "author", json!({"uid": "a1", "name": "Jo", "employer": {"values": "c1", "_content_type_id": "company"}})).await;
    put(store, "author", json!({"uid": "a2", "name": "Sam", "employer": {"values": "c1", "_content_type_id": "company"}})).await;
    put(store, ASSETS, json!({"uid": "blt9", "filename": "hero.png", "_internal_url": "/assets/blt9/hero.png"})).await;
}

#[tokio::test]
async fn nested_references_resolve_to_the_leaves() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    put(&store, "post", json!({
        "uid": "p1",
        "title": "Hello",
        "authors": {"values": ["a2", "ghost", "a1"], "_content_type_id": "author"},
        "hero": {"values": "blt9", "_content_type_id": "_assets"}
    }))
    .await;

    let found = store.find_one(Query::new("post", LOCALE).with_uid("p1")).await.unwrap();
    let post = found.item().unwrap();

    let names: Vec<&str> = post["authors"].as_array().unwrap().iter().map(|a| a["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["Sam", "Jo"]);
    assert_eq!(post["authors"][0]["employer"]["name"], "Acme");
    assert_eq!(post["hero"]["_internal_url"], "/assets/blt9/hero.png");
}

#[tokio::test]
async fn a_post_may_reference_other_posts_but_not_itself() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    put(&store, "post", json!({
        "uid": "p1",
        "related": {"posts": {"values": ["p1", "p2"], "_content_type_id": "post"}}
    }))
    .await;
    put(&store, "post", json!({
        "uid": "p2",
        "related": {"posts": {"values": ["p1"], "_content_type_id": "post"}}
    }))
    .await;

    let found = store.find_one(Query::new("post", LOCALE).with_uid("p1")).await.unwrap();
    let related = &found.item().unwrap()["related"]["posts"];

    assert_eq!(related.as_array().unwrap().len(), 1);
    assert_eq!(related[0]["uid"], "p2");
    assert_eq!(related[0]["related"]["posts"], json!([]));
}

#[tokio::test]
async fn every_entry_of_a_find_is_resolved() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    for (uid, author) in [("p1", "a1"), ("p2", "a2"), ("p3", "a1")] {
        put(&store, "post", json!({"uid": uid, "authors": {"values": [author], "_content_type_id": "author"}})).await;
    }

    let query = Query::new("post", LOCALE).with_filter("authors.uid", json!("a1")).with_count();
    let found = store
        .find(query, FindOptions::default().sorted_by("uid", vellum::query::types::SortOrder::Asc))
        .await
        .unwrap();

    assert_eq!(found.count(), Some(2));
    let uids: Vec<&str> = found.items().iter().map(|post| post["uid"].as_str().unwrap()).collect();
    assert_eq!(uids, vec!["p1", "p3"]);
    assert!(found.items().iter().all(|post| post["authors"][0]["name"] == "Jo"));
}

#[tokio::test]
async fn filters_can_reach_two_references_deep() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    put(&store, "company", json!({"uid": "c2", "name": "Globex"})).await;
    put(&store, "author", json!({"uid": "a3", "name": "Lee", "employer": {"values": "c2", "_content_type_id": "company"}})).await;
    put(&store, "post", json!({"uid": "p1", "authors": {"values": ["a1"], "_content_type_id": "author"}})).await;
    put(&store, "post", json!({"uid": "p2", "authors": {"values": ["a3"], "_content_type_id": "author"}})).await;

    let query = Query::new("post", LOCALE).with_filter("authors.employer.name", json!("Globex"));
    let found = store.find(query, FindOptions::default()).await.unwrap();

    assert_eq!(found.items().len(), 1);
    assert_eq!(found.items()[0]["uid"], "p2");
}

#[tokio::test]
async fn references_can_be_left_unresolved() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    let placeholder = json!({"values": ["a1"], "_content_type_id": "author"});
    put(&store, "post", json!({"uid": "p1", "authors": placeholder})).await;

    let query = Query::new("post", LOCALE).with_uid("p1").without_references();
    let found = store.find_one(query).await.unwrap();

    assert_eq!(found.item().unwrap()["authors"], placeholder);
}

#[tokio::test]
async fn synced_entries_resolve_after_marking() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    blog(&store).await;
    let schema = ContentTypeSchema::from_payload(&store.index().schema(LOCALE, "post").unwrap()).unwrap();

    let mut synced = prepare_entry(json!({
        "title": "From origin",
        "authors": [{"uid": "a1", "_content_type_uid": "author"}],
        "hero": {"uid": "blt9", "filename": "hero.png"},
        "ACL": {},
        "publish_details": {"environment": "production"},
        "_metadata": {"uid": "p7"}
    }));
    mark_references(&schema.schema, &mut synced, false);
    put(&store, "post", synced).await;

    let found = store.find_one(Query::new("post", LOCALE).with_uid("p7")).await.unwrap();
    let post = found.item().unwrap();
    assert_eq!(post["authors"][0]["name"], "Jo");
    assert_eq!(post["hero"]["filename"], "hero.png");
    assert!(post.get("ACL").is_none());
    assert!(post["published_at"].as_str().unwrap().ends_with('Z'));
}
