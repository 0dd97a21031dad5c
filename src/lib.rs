pub mod core;
pub mod schema;
pub mod index;
pub mod query;
pub mod resolver;
pub mod result;
pub mod storage;
pub mod assets;

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                               VELLUM STRUCT ARCHITECTURE                                   │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── CORE LAYER ─────────────────────────────────────────┐
│                                                                                            │
│  ┌──────────────────────────────────────────────────────────────────────────────────┐      │
│  │                             struct ContentStore                                  │      │
│  │  ┌────────────────────────────────────────────────────────────────────────────┐  │      │
│  │  │ config: Config                       // Languages, provider, cache flags   │  │      │
│  │  │ index: Arc<InMemoryIndex>            // Routes, schemas, assets per locale │  │      │
│  │  │ backend: Arc<dyn StorageBackend>     // File | Embedded | Networked        │  │      │
│  │  └────────────────────────────────────────────────────────────────────────────┘  │      │
│  │  find_one / find / count ─► QueryNormalizer ─► backend or index ─► Resolver      │      │
│  │  insert / upsert / remove / bulk_insert / bulk_delete ─► backend                 │      │
│  └──────────────────────────────────────────────────────────────────────────────────┘      │
│                                                                                            │
│  ┌──────────────────┐  ┌────────────────────┐  ┌──────────────────────────────────┐        │
│  │ struct Config    │  │ struct StoredRecord│  │ struct Error                     │        │
│  │ • storage        │  │ • _uid             │  │ • kind: ErrorKind                │        │
│  │ • languages      │  │ • _content_type_uid│  │ • context: String                │        │
│  │ • cache          │  │ • locale           │  │ • source: Option<Box<dyn Error>> │        │
│  │ • assets         │  │ • _data: Value     │  │                                  │        │
│  └──────────────────┘  └────────────────────┘  └──────────────────────────────────┘        │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── QUERY LAYER ─────────────────────────────────────────┐
│                                                                                            │
│  ┌─────────────────────────┐  ┌────────────────────────┐  ┌─────────────────────────────┐  │
│  │ struct Query            │  │ struct DocumentMatcher │  │ struct QueryNormalizer<'a>  │  │
│  │ • partition             │  │ • conditions           │  │ • index: &InMemoryIndex     │  │
│  │ • filter: Map           │  │ $eq $ne $in $nin $gt   │  │ • runner: &dyn SubQuery...  │  │
│  │ • include_references    │  │ $gte $lt $lte $exists  │  │ author.uid  -> author.values│  │
│  │ • include_count         │  │ $regex $and $or $nor   │  │ author.name -> {$in: uids}  │  │
│  │ • raw                   │  └────────────────────────┘  └─────────────────────────────┘  │
│  └─────────────────────────┘                                                               │
│  ┌──────────────────────────────────────────┐  ┌─────────────────────────────────────────┐ │
│  │ order::execute                           │  │ struct ReferenceResolver<'a>            │ │
│  │ filter ─► stable sort (BSON order)       │  │ frontier of Seed {pointer, ancestors}   │ │
│  │ ─► count ─► skip ─► limit                │  │ fetch per content type (try_join_all)   │ │
│  └──────────────────────────────────────────┘  │ (ct, uid) already an ancestor ─► skip   │ │
│                                                └─────────────────────────────────────────┘ │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌───────────────────────────────────── STORAGE LAYER ────────────────────────────────────────┐
│                                                                                            │
│                         trait StorageBackend (async, Send + Sync)                          │
│          find · find_one · count · insert · upsert · remove · bulk_insert · bulk_delete    │
│                                                                                            │
│  ┌──────────────────────────┐  ┌──────────────────────────┐  ┌──────────────────────────┐  │
│  │ FileBackend              │  │ EmbeddedBackend          │  │ NetworkedBackend         │  │
│  │ <content>/<ct>.json      │  │ sled tree per locale     │  │ MongoDB collections      │  │
│  │ per-path tokio Mutex     │  │ key = ct \0 uid          │  │ _content_types _assets   │  │
│  │ uuid staging + rename    │  │ CAS insert, Batch bulk   │  │ _routes _entries         │  │
│  │ PartitionCache (LRU)     │  │                          │  │ unique (ct, locale, uid) │  │
│  │ FileLock (flock)         │  │                          │  │ filters under `_data.`   │  │
│  └──────────────────────────┘  └──────────────────────────┘  └──────────────────────────┘  │
│                 │                          │                             │                 │
│                 └──────────────────────────┼─────────────────────────────┘                 │
│                                            ▼                                               │
│                     InMemoryIndex (parking_lot::RwLock, write-through)                     │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌───────────────────────────────────── ASSET LAYER ──────────────────────────────────────────┐
│                                                                                            │
│  ┌────────────────────────────┐  ┌──────────────────────────┐  ┌────────────────────────┐  │
│  │ struct AssetPipeline       │  │ struct AssetScanner      │  │ trait AssetDownloader  │  │
│  │ publish · unpublish        │  │ legacy + current urls    │  │ HttpDownloader         │  │
│  │ delete_asset · rewrite     │  │ collect · rewrite        │  │ trait ObjectStore      │  │
│  │ target: Local | Remote     │  │ AssetPath (config keys)  │  │ put · delete · list    │  │
│  └────────────────────────────┘  └──────────────────────────┘  └────────────────────────┘  │
└────────────────────────────────────────────────────────────────────────────────────────────┘
*/
