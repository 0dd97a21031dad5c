use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Number,
    Boolean,
    Isodate,
    File,
    Link,
    Group,
    Reference,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    #[serde(default)]
    pub markdown: bool,
}

/// One field of a content type. `schema` is only populated for groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub uid: String,
    pub data_type: DataType,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema: Vec<FieldDefinition>,
    #[serde(default)]
    pub field_metadata: FieldMetadata,
}

impl FieldDefinition {
    pub fn text(uid: &str) -> Self {
        FieldDefinition {
            uid: uid.to_string(),
            data_type: DataType::Text,
            multiple: false,
            reference_to: None,
            schema: Vec::new(),
            field_metadata: FieldMetadata::default(),
        }
    }

    pub fn reference(uid: &str, reference_to: &str, multiple: bool) -> Self {
        FieldDefinition {
            data_type: DataType::Reference,
            multiple,
            reference_to: Some(reference_to.to_string()),
            ..FieldDefinition::text(uid)
        }
    }

    pub fn file(uid: &str, multiple: bool) -> Self {
        FieldDefinition {
            data_type: DataType::File,
            multiple,
            ..FieldDefinition::text(uid)
        }
    }

    pub fn group(uid: &str, multiple: bool, schema: Vec<FieldDefinition>) -> Self {
        FieldDefinition {
            data_type: DataType::Group,
            multiple,
            schema,
            ..FieldDefinition::text(uid)
        }
    }
}

/// A `_content_types` payload, parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeSchema {
    pub uid: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub schema: Vec<FieldDefinition>,
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

impl ContentTypeSchema {
    pub fn new(uid: &str, schema: Vec<FieldDefinition>) -> Self {
        let references = find_references(&schema);
        ContentTypeSchema {
            uid: uid.to_string(),
            title: None,
            schema,
            references,
        }
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::invalid_argument(format!("Malformed content type schema: {}", e)))
    }

    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Flatten reference fields into `path -> referenced content type`.
/// Nested group fields are joined with `:`. File fields stay out: downloaded
/// assets are stored inline and filter like any other object.
pub fn find_references(schema: &[FieldDefinition]) -> BTreeMap<String, String> {
    let mut references = BTreeMap::new();
    collect_references(schema, None, &mut references);
    references
}

fn collect_references(
    schema: &[FieldDefinition],
    parent: Option<&str>,
    references: &mut BTreeMap<String, String>,
) {
    for field in schema {
        let path = match parent {
            Some(parent) => format!("{}:{}", parent, field.uid),
            None => field.uid.clone(),
        };
        match field.data_type {
            DataType::Reference => {
                if let Some(target) = &field.reference_to {
                    references.insert(path, target.clone());
                }
            }
            DataType::Group => collect_references(&field.schema, Some(&path), references),
            _ => {}
        }
    }
}

/// Recompute `references` on a content type payload in place.
/// Payloads without a `schema` array are left untouched.
pub fn attach_references(payload: &mut Value) -> Result<()> {
    let Some(raw_schema) = payload.get("schema") else {
        return Ok(());
    };
    let fields: Vec<FieldDefinition> = serde_json::from_value(raw_schema.clone())
        .map_err(|e| Error::invalid_argument(format!("Malformed content type schema: {}", e)))?;
    let references = serde_json::to_value(find_references(&fields))?;

    if let Some(object) = payload.as_object_mut() {
        object.insert("references".to_string(), references);
    }
    Ok(())
}

/// Drop `schema` plus any caller-named keys from content type payloads.
pub fn trim_schema(payloads: &mut [Value], remove: &[&str]) {
    for payload in payloads.iter_mut() {
        if let Some(object) = payload.as_object_mut() {
            object.remove("schema");
            for key in remove {
                object.remove(*key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_references_use_colon_paths() {
        let schema = vec![
            FieldDefinition::text("title"),
            FieldDefinition::reference("author", "author", false),
            FieldDefinition::group("seo", false, vec![
                FieldDefinition::reference("related", "post", true),
                FieldDefinition::file("image", false),
            ]),
        ];

        let references = find_references(&schema);
        assert_eq!(references.len(), 2);
        assert_eq!(references["author"], "author");
        assert_eq!(references["seo:related"], "post");
        assert!(!references.contains_key("seo:image"));
    }

    #[test]
    fn attach_replaces_stale_references() {
        let mut payload = json!({
            "uid": "post",
            "schema": [
                {"uid": "author", "data_type": "reference", "reference_to": "author"}
            ],
            "references": {"editor": "person"}
        });

        attach_references(&mut payload).unwrap();
        assert_eq!(payload["references"], json!({"author": "author"}));
    }

    #[test]
    fn unknown_data_types_are_tolerated() {
        let payload = json!({
            "uid": "page",
            "schema": [{"uid": "blocks", "data_type": "json"}]
        });
        let parsed = ContentTypeSchema::from_payload(&payload).unwrap();
        assert_eq!(parsed.schema[0].data_type, DataType::Other);
    }

    #[test]
    fn trim_drops_schema_and_extra_keys() {
        let mut payloads = vec![json!({"uid": "post", "schema": [], "references": {}, "title": "Post"})];
        trim_schema(&mut payloads, &["references"]);
        assert_eq!(payloads[0], json!({"uid": "post", "title": "Post"}));
    }
}
