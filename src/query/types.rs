use std::collections::{BTreeMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord, ASSETS};

/// Reserved filter key addressing the record uid rather than a payload field.
pub const UID_KEY: &str = "_uid";

/// Control keys stripped from a logical query before it is used as a filter.
const CONTROL_KEYS: [&str; 7] = [
    "_content_type_uid",
    "locale",
    "_remove",
    "include_references",
    "include_count",
    "_include_previous",
    "_include_next",
];

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,   // Ascending: 0 → 9, A → Z
    Desc,  // Descending: 9 → 0, Z → A
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(path: &str, order: SortOrder) -> Self {
        SortKey { path: path.to_string(), order }
    }

    /// `published_at` descending, applied when a query names no sort.
    pub fn default_sort() -> Vec<SortKey> {
        vec![SortKey::new("published_at", SortOrder::Desc)]
    }
}

fn required_str(object: &Map<String, Value>, key: &str) -> Result<String> {
    match object.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(_) => Err(Error::invalid_argument(format!("'{}' must be a non-empty string", key))),
        None => Err(Error::invalid_argument(format!("'{}' is required", key))),
    }
}

fn optional_bool(object: &Map<String, Value>, key: &str, default: bool) -> Result<bool> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(Error::invalid_argument(format!("'{}' must be a boolean", key))),
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::invalid_argument(format!("{} must be a JSON object", what)))
}

fn partition_of(object: &Map<String, Value>) -> Result<Partition> {
    Ok(Partition::new(
        required_str(object, "_content_type_uid")?,
        required_str(object, "locale")?,
    ))
}

/// A logical read: partition, payload-relative filter and inclusion flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub partition: Partition,
    pub filter: Map<String, Value>,
    pub include_references: bool,
    pub include_count: bool,
    pub raw: bool, // `_remove`: hand back stored rows, no envelope, no references
}

impl Query {
    pub fn new(content_type_uid: &str, locale: &str) -> Self {
        Query {
            partition: Partition::new(content_type_uid, locale),
            filter: Map::new(),
            include_references: true,
            include_count: false,
            raw: false,
        }
    }

    pub fn with_uid(self, uid: &str) -> Self {
        self.with_filter(UID_KEY, Value::String(uid.to_string()))
    }

    pub fn with_filter(mut self, path: &str, predicate: Value) -> Self {
        self.filter.insert(path.to_string(), predicate);
        self
    }

    pub fn without_references(mut self) -> Self {
        self.include_references = false;
        self
    }

    pub fn with_count(mut self) -> Self {
        self.include_count = true;
        self
    }

    pub fn content_type_uid(&self) -> &str {
        &self.partition.content_type_uid
    }

    pub fn locale(&self) -> &str {
        &self.partition.locale
    }

    /// Parse `{_content_type_uid, locale, _uid?, _remove?, include_references?, include_count?, ...filter}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Query")?;
        let partition = partition_of(object)?;
        let raw = optional_bool(object, "_remove", false)?;
        let include_references = optional_bool(object, "include_references", true)?;
        let include_count = optional_bool(object, "include_count", false)?;

        let filter = object
            .iter()
            .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()))
            .map(|(key, predicate)| (key.clone(), predicate.clone()))
            .collect();

        Ok(Query {
            partition,
            filter,
            include_references: include_references && !raw,
            include_count,
            raw,
        })
    }
}

/// Options of `find`: explicit sort keys (empty means default), skip, limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn paged(skip: usize, limit: usize) -> Self {
        FindOptions { sort: Vec::new(), skip, limit: Some(limit) }
    }

    pub fn sorted_by(mut self, path: &str, order: SortOrder) -> Self {
        self.sort.push(SortKey::new(path, order));
        self
    }

    /// Requested keys, or the default when none were given, always ending on
    /// `_uid` ascending so ties page identically on every backend.
    pub fn effective_sort(&self) -> Vec<SortKey> {
        let mut keys = if self.sort.is_empty() {
            SortKey::default_sort()
        } else {
            self.sort.clone()
        };
        if !keys.iter().any(|key| key.path == UID_KEY) {
            keys.push(SortKey::new(UID_KEY, SortOrder::Asc));
        }
        keys
    }

    /// Parse `{sort?: {path: 1 | -1 | "asc" | "desc"}, skip?, limit?}`. A leading
    /// `_data.` on sort paths is accepted and dropped. `limit: 0` means no limit.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Find options")?;
        let mut options = FindOptions::default();

        if let Some(sort) = object.get("sort") {
            let sort = as_object(sort, "'sort'")?;
            for (path, direction) in sort {
                let order = match direction {
                    Value::Number(n) if n.as_i64() == Some(1) => SortOrder::Asc,
                    Value::Number(n) if n.as_i64() == Some(-1) => SortOrder::Desc,
                    Value::String(s) if s.eq_ignore_ascii_case("asc") => SortOrder::Asc,
                    Value::String(s) if s.eq_ignore_ascii_case("desc") => SortOrder::Desc,
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "Sort direction of '{}' must be 1, -1, \"asc\" or \"desc\"",
                            path
                        )))
                    }
                };
                let path = path.strip_prefix("_data.").unwrap_or(path);
                options.sort.push(SortKey::new(path, order));
            }
        }

        options.skip = optional_count(object, "skip")?.unwrap_or(0);
        options.limit = optional_count(object, "limit")?.filter(|limit| *limit > 0);
        Ok(options)
    }
}

fn optional_count(object: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| Error::invalid_argument(format!("'{}' must be a non-negative integer", key))),
    }
}

/// Physical result of a backend `find`: the requested page plus the size of the full match set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindResult {
    pub records: Vec<StoredRecord>,
    pub count: usize,
}

/// `insert` / `upsert` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub record: StoredRecord,
}

impl WriteRequest {
    pub fn new(content_type_uid: &str, locale: &str, uid: &str, data: Value) -> Self {
        WriteRequest {
            record: StoredRecord::new(&Partition::new(content_type_uid, locale), uid, data),
        }
    }

    /// Parse `{_content_type_uid, locale, _uid, _data}`. Without `_uid` the
    /// payload's own `uid` (or `entry.uid`) is used.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Write request")?;
        let partition = partition_of(object)?;
        let data = object
            .get("_data")
            .filter(|data| data.is_object())
            .cloned()
            .ok_or_else(|| Error::invalid_argument("'_data' must be a JSON object"))?;

        let uid = match object.get(UID_KEY) {
            Some(Value::String(uid)) if !uid.is_empty() => uid.clone(),
            Some(_) => return Err(Error::invalid_argument("'_uid' must be a non-empty string")),
            None => StoredRecord::uid_of_payload(&data)
                .ok_or_else(|| Error::invalid_argument("'_uid' is required"))?,
        };

        Ok(WriteRequest { record: StoredRecord::new(&partition, uid, data) })
    }
}

/// `remove`: the whole partition when `uids` is `None`, otherwise only those records.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveRequest {
    pub partition: Partition,
    pub uids: Option<Vec<String>>,
}

impl RemoveRequest {
    pub fn partition(content_type_uid: &str, locale: &str) -> Self {
        RemoveRequest { partition: Partition::new(content_type_uid, locale), uids: None }
    }

    pub fn records(content_type_uid: &str, locale: &str, uids: &[&str]) -> Self {
        RemoveRequest {
            partition: Partition::new(content_type_uid, locale),
            uids: Some(uids.iter().map(|uid| uid.to_string()).collect()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Remove request")?;
        let partition = partition_of(object)?;
        let uids = match object.get(UID_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(uid)) => Some(vec![uid.clone()]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| Error::invalid_argument("'_uid' array must contain strings"))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(_) => return Err(Error::invalid_argument("'_uid' must be a string or an array of strings")),
        };
        Ok(RemoveRequest { partition, uids })
    }
}

/// Full replacement of a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkInsert {
    pub partition: Partition,
    pub records: Vec<StoredRecord>,
}

impl BulkInsert {
    /// Every payload must carry a uid (`uid`, or `entry.uid` for routes), and
    /// no uid may appear twice.
    pub fn new(partition: Partition, payloads: Vec<Value>) -> Result<Self> {
        let records = payloads
            .into_iter()
            .map(|payload| {
                if !payload.is_object() {
                    return Err(Error::invalid_argument(format!("Bulk payload for {} must be an object", partition)));
                }
                let uid = StoredRecord::uid_of_payload(&payload).ok_or_else(|| {
                    Error::invalid_argument(format!("Bulk payload for {} has no uid", partition))
                })?;
                Ok(StoredRecord::new(&partition, uid, payload))
            })
            .collect::<Result<Vec<_>>>()?;

        {
            let mut seen = HashSet::with_capacity(records.len());
            if let Some(duplicate) = records.iter().find(|record| !seen.insert(record.uid.as_str())) {
                return Err(Error::invalid_argument(format!(
                    "Bulk payload for {} repeats uid '{}'",
                    partition, duplicate.uid
                )));
            }
        }
        Ok(BulkInsert { partition, records })
    }

    /// Parse `{_content_type_uid, locale, entries[] | assets[]}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Bulk insert")?;
        let partition = partition_of(object)?;
        let preferred = if partition.content_type_uid == ASSETS { ["assets", "entries"] } else { ["entries", "assets"] };
        let payloads = preferred
            .iter()
            .find_map(|key| object.get(*key))
            .ok_or_else(|| Error::invalid_argument("Bulk insert needs an 'entries' or 'assets' array"))?
            .as_array()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("Bulk insert payloads must be an array"))?;
        BulkInsert::new(partition, payloads)
    }
}

/// Removes every record of a partition whose field holds any of the listed values.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDelete {
    pub partition: Partition,
    pub objekts: BTreeMap<String, Vec<Value>>,
}

impl BulkDelete {
    pub fn new(partition: Partition, field: &str, values: Vec<Value>) -> Self {
        let mut objekts = BTreeMap::new();
        objekts.insert(field.to_string(), values);
        BulkDelete { partition, objekts }
    }

    /// Parse `{_content_type_uid, locale, objekts: {field: values[]}}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = as_object(value, "Bulk delete")?;
        let partition = partition_of(object)?;
        let objekts = as_object(
            object.get("objekts").ok_or_else(|| Error::invalid_argument("'objekts' is required"))?,
            "'objekts'",
        )?;

        let mut fields = BTreeMap::new();
        for (field, values) in objekts {
            let values = match values {
                Value::Array(values) => values.clone(),
                single => vec![single.clone()],
            };
            fields.insert(field.clone(), values);
        }
        Ok(BulkDelete { partition, objekts: fields })
    }

    /// Equivalent filter: `{$or: [{field: {$in: values}}, ...]}`.
    pub fn to_filter(&self) -> Map<String, Value> {
        let clauses: Vec<Value> = self
            .objekts
            .iter()
            .map(|(field, values)| json!({ field.as_str(): { "$in": values } }))
            .collect();
        let mut filter = Map::new();
        filter.insert("$or".to_string(), Value::Array(clauses));
        filter
    }
}
