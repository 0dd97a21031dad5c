use serde_json::{json, Value};
use crate::core::error::{Error, Result};
use crate::core::types::{Partition, StoredRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    Upsert,
    Remove,
    BulkInsert,
    BulkDelete,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Insert => "insert",
            WriteOperation::Upsert => "upsert",
            WriteOperation::Remove => "remove",
            WriteOperation::BulkInsert => "bulk_insert",
            WriteOperation::BulkDelete => "bulk_delete",
        }
    }
}

/// The shapes handed back to callers. Single results are `None` when nothing
/// matched; multi results are never absent, only empty.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Entry(Option<Value>),
    Entries { entries: Vec<Value>, count: Option<usize> },
    Asset(Option<Value>),
    Assets { assets: Vec<Value>, count: Option<usize> },
    Count(usize),
    Raw(Vec<StoredRecord>), // `_remove` reads: stored rows as-is
    Written { operation: WriteOperation, affected: usize },
}

impl Envelope {
    pub fn single(partition: &Partition, item: Option<Value>) -> Self {
        if partition.is_assets() {
            Envelope::Asset(item)
        } else {
            Envelope::Entry(item)
        }
    }

    pub fn many(partition: &Partition, items: Vec<Value>, count: Option<usize>) -> Self {
        if partition.is_assets() {
            Envelope::Assets { assets: items, count }
        } else {
            Envelope::Entries { entries: items, count }
        }
    }

    pub fn written(operation: WriteOperation, affected: usize) -> Self {
        Envelope::Written { operation, affected }
    }

    /// The single entry or asset, if this is a single-result envelope that matched.
    pub fn item(&self) -> Option<&Value> {
        match self {
            Envelope::Entry(item) | Envelope::Asset(item) => item.as_ref(),
            _ => None,
        }
    }

    pub fn items(&self) -> &[Value] {
        match self {
            Envelope::Entries { entries, .. } => entries,
            Envelope::Assets { assets, .. } => assets,
            _ => &[],
        }
    }

    pub fn into_items(self) -> Vec<Value> {
        match self {
            Envelope::Entries { entries, .. } => entries,
            Envelope::Assets { assets, .. } => assets,
            Envelope::Entry(item) | Envelope::Asset(item) => item.into_iter().collect(),
            Envelope::Raw(records) => records.into_iter().map(|record| record.data).collect(),
            Envelope::Count(_) | Envelope::Written { .. } => Vec::new(),
        }
    }

    pub fn count(&self) -> Option<usize> {
        match self {
            Envelope::Count(count) => Some(*count),
            Envelope::Entries { count, .. } | Envelope::Assets { count, .. } => *count,
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Envelope::Entry(item) => json!({ "entry": item }),
            Envelope::Asset(item) => json!({ "asset": item }),
            Envelope::Entries { entries, count } => with_count(json!({ "entries": entries }), *count),
            Envelope::Assets { assets, count } => with_count(json!({ "assets": assets }), *count),
            Envelope::Count(count) => json!({ "count": count }),
            Envelope::Raw(records) => serde_json::to_value(records)?,
            Envelope::Written { operation, affected } => json!({
                "_write_operation_": { "operation": operation.as_str(), "affected": affected }
            }),
        };
        Ok(value)
    }

    /// Shape a raw result object (e.g. one returned by a plugin) into an envelope.
    ///
    /// A numeric `count` with no item list, or a numeric `entries`, is a
    /// count-only answer. Missing or null lists become empty; a null single
    /// result stays `None`.
    pub fn from_value(raw: Value) -> Result<Self> {
        let Value::Object(mut object) = raw else {
            return Err(Error::invalid_argument("Result envelope must be a JSON object"));
        };

        if let Some(count) = object.get("entries").and_then(Value::as_u64) {
            return Ok(Envelope::Count(count as usize));
        }
        let count = object.get("count").and_then(Value::as_u64).map(|n| n as usize);
        if let Some(entries) = object.remove("entries") {
            return Ok(Envelope::Entries { entries: list(entries)?, count });
        }
        if let Some(assets) = object.remove("assets") {
            return Ok(Envelope::Assets { assets: list(assets)?, count });
        }
        if let Some(entry) = object.remove("entry") {
            return Ok(Envelope::Entry(Some(entry).filter(|entry| !entry.is_null())));
        }
        if let Some(asset) = object.remove("asset") {
            return Ok(Envelope::Asset(Some(asset).filter(|asset| !asset.is_null())));
        }
        if let Some(count) = count {
            return Ok(Envelope::Count(count));
        }
        Err(Error::invalid_argument(format!(
            "Unrecognised result shape with keys [{}]",
            object.keys().cloned().collect::<Vec<_>>().join(", ")
        )))
    }
}

fn with_count(mut value: Value, count: Option<usize>) -> Value {
    if let (Some(count), Some(object)) = (count, value.as_object_mut()) {
        object.insert("count".to_string(), json!(count));
    }
    value
}

fn list(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        _ => Err(Error::invalid_argument("Result lists must be arrays")),
    }
}
