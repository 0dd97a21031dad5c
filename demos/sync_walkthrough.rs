/// Vellum walkthrough
///
/// Plays the part of a sync job feeding the store, then reads back the way a
/// site renderer would:
/// - Content types and entries (with references)
/// - Assets published without downloading binaries
/// - Finds with reference filters, counts and pagination
/// - Route lookups and cascading deletes

use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use vellum::assets::download::HttpDownloader;
use vellum::assets::pipeline::{AssetPipeline, AssetTarget};
use vellum::core::config::Config;
use vellum::core::store::ContentStore;
use vellum::core::telemetry::init_subscriber;
use vellum::core::types::{Partition, CONTENT_TYPES, ROUTES};
use vellum::query::types::{BulkInsert, FindOptions, Query, RemoveRequest, SortOrder, WriteRequest};
use vellum::schema::markers::{mark_references, prepare_entry};
use vellum::schema::schema::{ContentTypeSchema, FieldDefinition};

const LOCALE: &str = "en-us";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_subscriber();
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║        Vellum - Content Store Walkthrough     ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // Step 1: Open the store
    println!("Opening store...");
    let dir = tempfile::tempdir()?;
    let mut config = Config::with_languages(dir.path(), &[LOCALE]);
    config.assets.download = false;
    let store = Arc::new(ContentStore::open(config).await?);
    println!("  Contents under {}\n", dir.path().display());

    // Step 2: Content types
    println!("Step 2: CONTENT TYPES - Registering schemas...");
    let author = ContentTypeSchema::new("author", vec![FieldDefinition::text("name")]);
    let post = ContentTypeSchema::new("post", vec![
        FieldDefinition::text("title"),
        FieldDefinition::reference("author", "author", false),
        FieldDefinition::file("cover", false),
    ]);
    for schema in [&author, &post] {
        store
            .upsert(WriteRequest::new(CONTENT_TYPES, LOCALE, &schema.uid, schema.to_payload()?))
            .await?;
    }
    println!("  post references: {:?}\n", store.index().references(LOCALE, "post"));

    // Step 3: Assets
    println!("Step 3: ASSETS - Publishing records only...");
    let pipeline = AssetPipeline::new(
        store.clone(),
        Arc::new(HttpDownloader::new(Duration::from_secs(30))?),
        AssetTarget::Local,
    )?;
    let cover = pipeline
        .publish(json!({
            "uid": "blt01",
            "filename": "cover.jpg",
            "url": "https://images.contentstack.io/v3/assets/stack/blt01/v1/cover.jpg"
        }), LOCALE)
        .await?;
    println!("  cover served at {}\n", cover["_internal_url"]);

    // Step 4: Entries, as a sync job delivers them
    println!("Step 4: ENTRIES - Marking references and storing...");
    for (uid, name) in [("a1", "Jo"), ("a2", "Sam")] {
        store
            .upsert(WriteRequest::new("author", LOCALE, uid, json!({"uid": uid, "name": name})))
            .await?;
    }
    let posts = [
        ("p1", "Hello world", "a1", "/hello"),
        ("p2", "Second thoughts", "a2", "/second"),
        ("p3", "Third time", "a1", "/third"),
    ];
    for (uid, title, by, _) in posts {
        let mut entry = prepare_entry(json!({
            "title": title,
            "author": {"uid": by},
            "cover": {"uid": "blt01"},
            "ACL": {},
            "_metadata": {"uid": uid}
        }));
        mark_references(&post.schema, &mut entry, false);
        store.upsert(WriteRequest::new("post", LOCALE, uid, entry)).await?;
    }
    let routes = posts
        .iter()
        .map(|(uid, _, _, url)| json!({"entry": {"uid": uid, "url": url}, "content_type": {"uid": "post"}}))
        .collect();
    store.bulk_insert(BulkInsert::new(Partition::new(ROUTES, LOCALE), routes)?).await?;
    println!("  Stored {} posts\n", posts.len());

    // Step 5: Reads
    println!("Step 5: FIND - Querying...");
    let by_jo = store
        .find(
            Query::new("post", LOCALE).with_filter("author.name", json!("Jo")).with_count(),
            FindOptions::default().sorted_by("title", SortOrder::Asc),
        )
        .await?;
    println!("  posts by Jo: {:?}", by_jo.count());
    for item in by_jo.items() {
        println!("    {} by {} (cover {})", item["title"], item["author"]["name"], item["cover"]["_internal_url"]);
    }

    let page = store.find(Query::new("post", LOCALE), FindOptions::paged(1, 1)).await?;
    println!("  second newest: {}", page.items()[0]["title"]);
    println!("  envelope: {}\n", page.to_value()?);

    // Step 6: Routes
    println!("Step 6: ROUTES - Resolving urls...");
    match store.resolve_route(LOCALE, "/second").await? {
        Some(entry) => println!("  /second -> {}", entry["title"]),
        None => println!("  /second -> not found"),
    }
    println!();

    // Step 7: Cascading delete
    println!("Step 7: REMOVE - Dropping the post content type...");
    let removed = store.remove(RemoveRequest::partition("post", LOCALE)).await?;
    println!("  {}", removed.to_value()?);
    println!("  /hello now resolves to: {:?}", store.resolve_route(LOCALE, "/hello").await?);

    println!("\nDone!");
    Ok(())
}
