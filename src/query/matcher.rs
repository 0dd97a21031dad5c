use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use crate::core::error::{Error, Result};
use crate::core::types::StoredRecord;
use crate::query::order::{compare_values, same_type_class, values_equal};
use crate::query::types::UID_KEY;

pub const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

#[derive(Debug, Clone)]
enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    Field { path: String, conditions: Vec<Condition> },
}

/// Document matcher - evaluates a Mongo-style filter against stored records.
///
/// Paths are relative to the payload, except `_uid` which addresses the record
/// uid. Dotted paths fan out over arrays; an array field matches a scalar
/// predicate when any element does. Regexes are compiled up front so a bad
/// filter fails before any I/O.
#[derive(Debug, Clone)]
pub struct DocumentMatcher {
    root: Predicate,
}

impl DocumentMatcher {
    pub fn new(filter: &Map<String, Value>) -> Result<Self> {
        Ok(DocumentMatcher { root: compile_object(filter)? })
    }

    pub fn match_all() -> Self {
        DocumentMatcher { root: Predicate::And(Vec::new()) }
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        evaluate(&self.root, record)
    }
}

fn compile_object(filter: &Map<String, Value>) -> Result<Predicate> {
    let mut clauses = Vec::with_capacity(filter.len());
    for (key, value) in filter {
        clauses.push(compile_entry(key, value)?);
    }
    Ok(Predicate::And(clauses))
}

fn compile_entry(key: &str, value: &Value) -> Result<Predicate> {
    if key.starts_with('$') {
        let branches = value
            .as_array()
            .ok_or_else(|| Error::invalid_argument(format!("{} expects an array of filters", key)))?
            .iter()
            .map(|branch| {
                branch
                    .as_object()
                    .ok_or_else(|| Error::invalid_argument(format!("{} branches must be objects", key)))
                    .and_then(compile_object)
            })
            .collect::<Result<Vec<_>>>()?;
        return match key {
            "$and" => Ok(Predicate::And(branches)),
            "$or" => Ok(Predicate::Or(branches)),
            "$nor" => Ok(Predicate::Nor(branches)),
            other => Err(Error::invalid_argument(format!("Unsupported top-level operator {}", other))),
        };
    }

    Ok(Predicate::Field {
        path: key.to_string(),
        conditions: compile_conditions(value)?,
    })
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|object| !object.is_empty() && object.keys().all(|key| key.starts_with('$')))
}

fn array_operand(operator: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| Error::invalid_argument(format!("{} expects an array", operator)))
}

fn compile_conditions(value: &Value) -> Result<Vec<Condition>> {
    if !is_operator_object(value) {
        return Ok(vec![Condition::Eq(value.clone())]);
    }

    let Some(operators) = value.as_object() else {
        return Ok(Vec::new());
    };
    let options = operators.get("$options").and_then(Value::as_str).unwrap_or("");

    let mut conditions = Vec::with_capacity(operators.len());
    for (operator, operand) in operators {
        let condition = match operator.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$in" => Condition::In(array_operand(operator, operand)?),
            "$nin" => Condition::Nin(array_operand(operator, operand)?),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$exists" => Condition::Exists(operand.as_bool().unwrap_or(!operand.is_null())),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| Error::invalid_argument("$regex expects a string pattern"))?;
                Condition::Regex(build_regex(pattern, options)?)
            }
            "$options" => continue,
            other => return Err(Error::invalid_argument(format!("Unsupported operator {}", other))),
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn build_regex(pattern: &str, options: &str) -> Result<Regex> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()?;
    Ok(regex)
}

/// Every value reachable at `path` (dotted), fanning out over arrays.
pub fn lookup<'a>(record: &'a StoredRecord, path: &str) -> Vec<&'a Value> {
    let mut found = Vec::new();
    if path == UID_KEY {
        return found;
    }
    let segments: Vec<&str> = path.split('.').collect();
    resolve(&record.data, &segments, &mut found);
    found
}

fn resolve<'a>(value: &'a Value, segments: &[&str], found: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };
    match value {
        Value::Object(object) => {
            if let Some(child) = object.get(*head) {
                resolve(child, rest, found);
            }
        }
        Value::Array(items) => {
            if let Ok(position) = head.parse::<usize>() {
                if let Some(item) = items.get(position) {
                    resolve(item, rest, found);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                resolve(item, segments, found);
            }
        }
        _ => {}
    }
}

fn evaluate(predicate: &Predicate, record: &StoredRecord) -> bool {
    match predicate {
        Predicate::And(clauses) => clauses.iter().all(|clause| evaluate(clause, record)),
        Predicate::Or(clauses) => clauses.iter().any(|clause| evaluate(clause, record)),
        Predicate::Nor(clauses) => !clauses.iter().any(|clause| evaluate(clause, record)),
        Predicate::Field { path, conditions } => {
            let uid;
            let candidates = if path == UID_KEY {
                uid = Value::String(record.uid.clone());
                vec![&uid]
            } else {
                lookup(record, path)
            };
            conditions.iter().all(|condition| check(condition, &candidates))
        }
    }
}

// Candidates plus the elements of array candidates.
fn flattened<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut values = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        values.push(*candidate);
        if let Value::Array(items) = candidate {
            values.extend(items.iter());
        }
    }
    values
}

fn equals_any(candidates: &[&Value], expected: &Value) -> bool {
    if expected.is_null() && candidates.is_empty() {
        return true;
    }
    flattened(candidates)
        .into_iter()
        .any(|candidate| values_equal(candidate, expected))
}

fn compares(candidates: &[&Value], operand: &Value, accept: fn(std::cmp::Ordering) -> bool) -> bool {
    flattened(candidates)
        .into_iter()
        .filter(|candidate| !candidate.is_array() || operand.is_array())
        .any(|candidate| {
            same_type_class(candidate, operand) && accept(compare_values(Some(candidate), Some(operand)))
        })
}

fn check(condition: &Condition, candidates: &[&Value]) -> bool {
    use std::cmp::Ordering::*;
    match condition {
        Condition::Eq(expected) => equals_any(candidates, expected),
        Condition::Ne(expected) => !equals_any(candidates, expected),
        Condition::In(options) => options.iter().any(|expected| equals_any(candidates, expected)),
        Condition::Nin(options) => !options.iter().any(|expected| equals_any(candidates, expected)),
        Condition::Gt(operand) => compares(candidates, operand, |o| o == Greater),
        Condition::Gte(operand) => compares(candidates, operand, |o| o != Less),
        Condition::Lt(operand) => compares(candidates, operand, |o| o == Less),
        Condition::Lte(operand) => compares(candidates, operand, |o| o != Greater),
        Condition::Exists(wanted) => candidates.is_empty() != *wanted,
        Condition::Regex(regex) => flattened(candidates)
            .into_iter()
            .filter_map(Value::as_str)
            .any(|text| regex.is_match(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::core::error::ErrorKind;
    use crate::core::types::Partition;

    fn post() -> StoredRecord {
        StoredRecord::new(
            &Partition::new("post", "en-us"),
            "p1",
            json!({
                "uid": "p1",
                "title": "Hello World",
                "views": 42,
                "tags": ["rust", "cms"],
                "author": {"values": "a1", "_content_type_id": "author"},
                "blocks": [{"related": {"values": ["p2", "p3"]}}, {"kind": "quote"}]
            }),
        )
    }

    fn matches(filter: Value) -> bool {
        let filter = filter.as_object().cloned().unwrap();
        DocumentMatcher::new(&filter).unwrap().matches(&post())
    }

    #[test]
    fn equality_reaches_into_arrays_and_nested_objects() {
        assert!(matches(json!({"tags": "rust"})));
        assert!(matches(json!({"author.values": "a1"})));
        assert!(matches(json!({"blocks.related.values": "p3"})));
        assert!(matches(json!({"blocks.kind": "quote"})));
        assert!(!matches(json!({"blocks.kind": "list"})));
        assert!(matches(json!({"_uid": "p1"})));
        assert!(matches(json!({"missing": null})));
    }

    #[test]
    fn comparison_operators_respect_type_brackets() {
        assert!(matches(json!({"views": {"$gt": 40, "$lte": 42}})));
        assert!(!matches(json!({"views": {"$gt": "40"}})));
        assert!(matches(json!({"views": {"$in": [1, 42.0]}})));
        assert!(matches(json!({"tags": {"$nin": ["go"]}})));
        assert!(matches(json!({"title": {"$ne": "Bye"}})));
    }

    #[test]
    fn logical_operators_and_exists() {
        assert!(matches(json!({"$or": [{"title": "nope"}, {"views": 42}]})));
        assert!(!matches(json!({"$nor": [{"views": 42}]})));
        assert!(matches(json!({"$and": [{"tags": "cms"}, {"author": {"$exists": true}}]})));
        assert!(matches(json!({"draft": {"$exists": false}})));
    }

    #[test]
    fn regex_honours_options() {
        assert!(matches(json!({"title": {"$regex": "^hello", "$options": "i"}})));
        assert!(!matches(json!({"title": {"$regex": "^hello"}})));
    }

    #[test]
    fn bad_filters_fail_at_compile_time() {
        for filter in [
            json!({"title": {"$regex": "("}}),
            json!({"title": {"$near": 1}}),
            json!({"$or": {"title": "x"}}),
            json!({"tags": {"$in": "rust"}}),
        ] {
            let err = DocumentMatcher::new(filter.as_object().unwrap()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "{}", filter);
        }
    }
}
