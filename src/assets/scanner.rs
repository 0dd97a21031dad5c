use std::collections::HashMap;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use url::Url;
use crate::core::error::Result;
use crate::schema::schema::{DataType, FieldDefinition};

// Legacy download urls: `https://api.contentstack.io/<...>/download?uid=<uid>`.
const LEGACY_PATTERN: &str =
    r#"https://(dev-new-|stag-new-|)(contentstack-|)api\.(built|contentstack)\.io/(.*?)/download(.*?)uid=([a-z0-9]+[^?&'"])(.*?)"#;
// Markdown bodies swallow the rest of the line after the uid.
const LEGACY_MARKDOWN_PATTERN: &str =
    r"https://(dev-new-|stag-new-|)(contentstack-|)api\.(built|contentstack)\.io/(.*?)/download(.*?)uid=([a-z0-9]+[^&?\s])((.*)[\n\s]?)";
// Current urls: `https://assets.contentstack.io/v3/assets/<stack>/<uid>/<version>/download`.
const CURRENT_PATTERN: &str =
    r"https://(dev-|stag-|)(assets|images)\.contentstack\.io/v\d/assets/(.*?)/(.*?)/(.*?)/download";

/// An asset url found inside a text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InTextAsset {
    pub uid: Option<String>,
    pub url: String,
    pub download_id: String,
}

impl InTextAsset {
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        if let Some(uid) = &self.uid {
            object.insert("uid".to_string(), json!(uid));
        }
        object.insert("url".to_string(), json!(self.url));
        object.insert("download_id".to_string(), json!(self.download_id));
        Value::Object(object)
    }
}

#[derive(Clone, Copy)]
enum UrlFamily {
    Legacy,
    Current,
}

impl UrlFamily {
    fn uid_group(self) -> usize {
        match self {
            UrlFamily::Legacy => 6,
            UrlFamily::Current => 4,
        }
    }

    /// Legacy ids are the whole path; current ids drop `/v<N>/assets/<stack>`.
    fn download_id(self, url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim_end()).ok()?;
        let skip = match self {
            UrlFamily::Legacy => 1,
            UrlFamily::Current => 4,
        };
        Some(parsed.path().split('/').skip(skip).collect::<Vec<_>>().join("/"))
    }
}

/// Finds and rewrites origin asset urls inside entry text fields.
pub struct AssetScanner {
    legacy: Regex,
    legacy_markdown: Regex,
    current: Regex,
}

impl AssetScanner {
    pub fn new() -> Result<Self> {
        Ok(AssetScanner {
            legacy: Regex::new(LEGACY_PATTERN)?,
            legacy_markdown: Regex::new(LEGACY_MARKDOWN_PATTERN)?,
            current: Regex::new(CURRENT_PATTERN)?,
        })
    }

    fn families(&self, markdown: bool) -> [(&Regex, UrlFamily); 2] {
        let legacy = if markdown { &self.legacy_markdown } else { &self.legacy };
        [(legacy, UrlFamily::Legacy), (&self.current, UrlFamily::Current)]
    }

    pub fn scan_text(&self, text: &str, markdown: bool) -> Vec<InTextAsset> {
        let mut found = Vec::new();
        for (regex, family) in self.families(markdown) {
            for captures in regex.captures_iter(text) {
                let url = captures[0].to_string();
                let Some(download_id) = family.download_id(&url) else {
                    continue;
                };
                found.push(InTextAsset {
                    uid: captures.get(family.uid_group()).map(|uid| uid.as_str().to_string()),
                    url,
                    download_id,
                });
            }
        }
        found
    }

    /// Replace every url whose stored asset (looked up by download id) has the
    /// same origin url by that asset's `_internal_url`.
    pub fn rewrite_text(&self, text: &str, markdown: bool, assets: &HashMap<String, Value>) -> String {
        let mut rewritten = text.to_string();
        for (regex, family) in self.families(markdown) {
            rewritten = regex
                .replace_all(&rewritten, |captures: &Captures| {
                    let matched = &captures[0];
                    let internal = family
                        .download_id(matched)
                        .and_then(|id| assets.get(&id))
                        .filter(|asset| asset.get("url").and_then(Value::as_str) == Some(matched))
                        .and_then(|asset| asset.get("_internal_url"))
                        .and_then(Value::as_str);
                    match internal {
                        Some(internal) if markdown => format!("{}\n", encode_uri(internal)),
                        Some(internal) => internal.to_string(),
                        None => matched.to_string(),
                    }
                })
                .into_owned();
        }
        rewritten
    }

    /// File-field assets (when binaries are downloaded) and in-text asset urls
    /// of an entry, as asset descriptors.
    pub fn collect_assets(&self, schema: &[FieldDefinition], entry: &Value, download_assets: bool) -> Vec<Value> {
        let mut assets = Vec::new();
        if let Some(object) = entry.as_object() {
            self.collect_fields(schema, object, download_assets, &mut assets);
        }
        assets
    }

    fn collect_fields(&self, schema: &[FieldDefinition], object: &Map<String, Value>, download_assets: bool, assets: &mut Vec<Value>) {
        for field in schema {
            let Some(value) = object.get(&field.uid) else {
                continue;
            };
            match field.data_type {
                DataType::File if download_assets => {
                    for item in each(value) {
                        if item.get("uid").is_some() {
                            assets.push(item.clone());
                        }
                    }
                }
                DataType::Text => {
                    for text in each(value).filter_map(Value::as_str) {
                        let markdown = field.field_metadata.markdown;
                        assets.extend(self.scan_text(text, markdown).iter().map(InTextAsset::to_value));
                    }
                }
                DataType::Group => {
                    for nested in each(value).filter_map(Value::as_object) {
                        self.collect_fields(&field.schema, nested, download_assets, assets);
                    }
                }
                _ => {}
            }
        }
    }

    /// Point an entry at its local assets: text urls become internal urls and,
    /// when binaries are downloaded, file fields become the stored asset records.
    /// `assets` is keyed by stored asset uid (the download id for in-text assets).
    pub fn rewrite_asset_urls(
        &self,
        schema: &[FieldDefinition],
        entry: &mut Value,
        assets: &HashMap<String, Value>,
        download_assets: bool,
    ) {
        if let Some(object) = entry.as_object_mut() {
            self.rewrite_fields(schema, object, assets, download_assets);
        }
    }

    fn rewrite_fields(
        &self,
        schema: &[FieldDefinition],
        object: &mut Map<String, Value>,
        assets: &HashMap<String, Value>,
        download_assets: bool,
    ) {
        for field in schema {
            let Some(value) = object.get_mut(&field.uid) else {
                continue;
            };
            match field.data_type {
                DataType::File if download_assets => {
                    for item in each_mut(value) {
                        let stored = item.get("uid").and_then(Value::as_str).and_then(|uid| assets.get(uid));
                        if let Some(stored) = stored {
                            *item = stored.clone();
                        }
                    }
                }
                DataType::Text => {
                    for item in each_mut(value) {
                        if let Value::String(text) = item {
                            *text = self.rewrite_text(text, field.field_metadata.markdown, assets);
                        }
                    }
                }
                DataType::Group => {
                    for nested in each_mut(value).filter_map(Value::as_object_mut) {
                        self.rewrite_fields(&field.schema, nested, assets, download_assets);
                    }
                }
                _ => {}
            }
        }
    }
}

fn each(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Array(items) => Box::new(items.iter()),
        other => Box::new(std::iter::once(other)),
    }
}

fn each_mut(value: &mut Value) -> Box<dyn Iterator<Item = &mut Value> + '_> {
    match value {
        Value::Array(items) => Box::new(items.iter_mut()),
        other => Box::new(std::iter::once(other)),
    }
}

/// Percent-encode each segment of a `/`-separated url path.
pub fn encode_uri(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
