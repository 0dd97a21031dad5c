use std::fmt;
use serde::{Serialize, Deserialize};
use serde_json::Value;

pub const ASSETS: &str = "_assets";
pub const ROUTES: &str = "_routes";
pub const CONTENT_TYPES: &str = "_content_types";

/// The three collections mirrored by the in-memory index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachedCollection {
    Assets,
    Routes,
    Schemas,
}

impl CachedCollection {
    pub const ALL: [CachedCollection; 3] = [
        CachedCollection::Assets,
        CachedCollection::Routes,
        CachedCollection::Schemas,
    ];

    pub fn of(content_type_uid: &str) -> Option<Self> {
        match content_type_uid {
            ASSETS => Some(CachedCollection::Assets),
            ROUTES => Some(CachedCollection::Routes),
            CONTENT_TYPES => Some(CachedCollection::Schemas),
            _ => None,
        }
    }

    pub fn content_type_uid(&self) -> &'static str {
        match self {
            CachedCollection::Assets => ASSETS,
            CachedCollection::Routes => ROUTES,
            CachedCollection::Schemas => CONTENT_TYPES,
        }
    }
}

/// `(content type, locale)`: the unit every backend stores and replaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub content_type_uid: String,
    pub locale: String,
}

impl Partition {
    pub fn new(content_type_uid: impl Into<String>, locale: impl Into<String>) -> Self {
        Partition {
            content_type_uid: content_type_uid.into(),
            locale: locale.into(),
        }
    }

    pub fn is_assets(&self) -> bool {
        self.content_type_uid == ASSETS
    }

    pub fn cached(&self) -> Option<CachedCollection> {
        CachedCollection::of(&self.content_type_uid)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.locale, self.content_type_uid)
    }
}

/// Persisted row. Field names are the on-disk names of the file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(rename = "_uid")]
    pub uid: String,
    #[serde(rename = "_content_type_uid")]
    pub content_type_uid: String,
    pub locale: String,
    #[serde(rename = "_data")]
    pub data: Value,
}

impl StoredRecord {
    pub fn new(partition: &Partition, uid: impl Into<String>, data: Value) -> Self {
        StoredRecord {
            uid: uid.into(),
            content_type_uid: partition.content_type_uid.clone(),
            locale: partition.locale.clone(),
            data,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.content_type_uid.clone(), self.locale.clone())
    }

    /// Uid carried by a bulk payload: `uid`, or `entry.uid` for routes.
    pub fn uid_of_payload(payload: &Value) -> Option<String> {
        payload
            .get("uid")
            .or_else(|| payload.get("entry").and_then(|entry| entry.get("uid")))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
