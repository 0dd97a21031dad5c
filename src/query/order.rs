use std::cmp::Ordering;
use serde_json::Value;
use crate::core::types::StoredRecord;
use crate::query::matcher::{lookup, DocumentMatcher};
use crate::query::types::{FindOptions, FindResult, SortKey, SortOrder, UID_KEY};

// BSON comparison order: null/missing < numbers < strings < objects < arrays < booleans.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

pub fn same_type_class(a: &Value, b: &Value) -> bool {
    type_rank(Some(a)) == type_rank(Some(b))
}

/// Total order over optional JSON values, identical on every backend.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ordering = compare_values(Some(left), Some(right));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((key_x, left), (key_y, right)) in x.iter().zip(y.iter()) {
                let ordering = key_x
                    .cmp(key_y)
                    .then_with(|| compare_values(Some(left), Some(right)));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Structural equality where `1` and `1.0` are the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(key, l)| y.get(key).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

fn sort_value<'a>(record: &'a StoredRecord, path: &str) -> Option<&'a Value> {
    lookup(record, path).into_iter().next()
}

/// Stable multi-key sort; records equal on every key keep storage order.
pub fn sort_records(records: &mut [StoredRecord], keys: &[SortKey]) {
    records.sort_by(|a, b| {
        for key in keys {
            let ordering = if key.path == UID_KEY {
                a.uid.cmp(&b.uid)
            } else {
                compare_values(sort_value(a, &key.path), sort_value(b, &key.path))
            };
            let ordering = match key.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// `skip` first, then `limit`.
pub fn paginate<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    let page = items.into_iter().skip(skip);
    match limit {
        Some(limit) => page.take(limit).collect(),
        None => page.collect(),
    }
}

/// Filter, sort and page an in-memory partition the way every backend does.
pub fn execute<'r>(
    records: impl IntoIterator<Item = &'r StoredRecord>,
    matcher: &DocumentMatcher,
    options: &FindOptions,
) -> FindResult {
    let mut matched: Vec<StoredRecord> = records
        .into_iter()
        .filter(|record| matcher.matches(record))
        .cloned()
        .collect();
    let count = matched.len();
    sort_records(&mut matched, &options.effective_sort());
    FindResult {
        records: paginate(matched, options.skip, options.limit),
        count,
    }
}
