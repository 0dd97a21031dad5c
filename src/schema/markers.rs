use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use crate::core::types::ASSETS;
use crate::schema::schema::{DataType, FieldDefinition};

/// Key that turns an object inside an entry payload into a reference placeholder.
pub const CONTENT_TYPE_MARKER: &str = "_content_type_id";
pub const VALUES_KEY: &str = "values";

pub fn is_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|object| object.contains_key(CONTENT_TYPE_MARKER) && object.contains_key(VALUES_KEY))
}

pub fn placeholder(values: Value, content_type_uid: &str) -> Value {
    json!({ VALUES_KEY: values, CONTENT_TYPE_MARKER: content_type_uid })
}

/// Rewrite every reference field of `entry` into a `{values, _content_type_id}`
/// placeholder, walking into groups (single and multiple). File fields are marked
/// as `_assets` placeholders only when binaries are not being downloaded.
pub fn mark_references(schema: &[FieldDefinition], entry: &mut Value, download_assets: bool) {
    if let Some(object) = entry.as_object_mut() {
        mark_fields(schema, object, download_assets);
    }
}

fn mark_fields(schema: &[FieldDefinition], object: &mut Map<String, Value>, download_assets: bool) {
    for field in schema {
        let Some(value) = object.get_mut(&field.uid) else {
            continue;
        };
        match field.data_type {
            DataType::Reference => {
                if let Some(target) = &field.reference_to {
                    if let Some(marked) = to_placeholder(value, target) {
                        *value = marked;
                    }
                }
            }
            DataType::File if !download_assets => {
                if let Some(marked) = to_placeholder(value, ASSETS) {
                    *value = marked;
                }
            }
            DataType::Group => match value {
                Value::Array(items) => {
                    for item in items.iter_mut().filter_map(Value::as_object_mut) {
                        mark_fields(&field.schema, item, download_assets);
                    }
                }
                Value::Object(nested) => mark_fields(&field.schema, nested, download_assets),
                _ => {}
            },
            _ => {}
        }
    }
}

/// Accepts a bare uid, a `{uid, ...}` object, or an array of either.
fn to_placeholder(value: &Value, content_type_uid: &str) -> Option<Value> {
    if value.is_null() || is_placeholder(value) {
        return None;
    }
    let values = match value {
        Value::String(_) => value.clone(),
        Value::Object(object) => object.get("uid")?.clone(),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(_) => Some(item.clone()),
                    Value::Object(object) => object.get("uid").cloned(),
                    _ => None,
                })
                .collect(),
        ),
        _ => return None,
    };
    Some(placeholder(values, content_type_uid))
}

/// Normalize a freshly synced entry: drop `ACL` and `publish_details`, promote
/// `_metadata.uid` to `uid` and stamp `published_at` with the current time.
pub fn prepare_entry(mut entry: Value) -> Value {
    if let Some(object) = entry.as_object_mut() {
        object.remove("ACL");
        object.remove("publish_details");

        let metadata_uid = object
            .get("_metadata")
            .and_then(|metadata| metadata.get("uid"))
            .cloned();
        if let Some(uid) = metadata_uid {
            object.insert("uid".to_string(), uid);
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        object.insert("published_at".to_string(), Value::String(now));
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_schema() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::text("title"),
            FieldDefinition::reference("author", "author", false),
            FieldDefinition::file("cover", false),
            FieldDefinition::group("blocks", true, vec![
                FieldDefinition::reference("related", "post", true),
            ]),
        ]
    }

    #[test]
    fn reference_fields_become_placeholders() {
        let mut entry = json!({
            "uid": "p1",
            "title": "Hello",
            "author": "a1",
            "cover": {"uid": "img1", "url": "https://images.contentstack.io/v3/assets/s/img1/x/cover.png"},
            "blocks": [
                {"related": [{"uid": "p2", "_content_type_uid": "post"}, "p3"]},
                {"related": []}
            ]
        });

        mark_references(&post_schema(), &mut entry, true);

        assert_eq!(entry["title"], "Hello");
        assert_eq!(entry["author"], json!({"values": "a1", "_content_type_id": "author"}));
        assert_eq!(entry["blocks"][0]["related"], json!({"values": ["p2", "p3"], "_content_type_id": "post"}));
        assert_eq!(entry["blocks"][1]["related"], json!({"values": [], "_content_type_id": "post"}));
        // Downloaded assets keep their inline descriptor.
        assert_eq!(entry["cover"]["uid"], "img1");
    }

    #[test]
    fn file_fields_are_marked_when_not_downloading() {
        let mut entry = json!({"cover": {"uid": "img1", "filename": "cover.png"}});
        mark_references(&post_schema(), &mut entry, false);
        assert_eq!(entry["cover"], json!({"values": "img1", "_content_type_id": "_assets"}));
    }

    #[test]
    fn marking_twice_is_stable() {
        let mut entry = json!({"author": "a1"});
        mark_references(&post_schema(), &mut entry, true);
        let once = entry.clone();
        mark_references(&post_schema(), &mut entry, true);
        assert_eq!(entry, once);
    }

    #[test]
    fn prepare_strips_sync_metadata() {
        let entry = prepare_entry(json!({
            "uid": "old",
            "ACL": {},
            "publish_details": {"environment": "prod"},
            "_metadata": {"uid": "blt123"}
        }));

        assert_eq!(entry["uid"], "blt123");
        assert!(entry.get("ACL").is_none());
        assert!(entry.get("publish_details").is_none());
        assert!(entry["published_at"].as_str().unwrap().ends_with('Z'));
    }
}
