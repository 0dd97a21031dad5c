use std::path::{Path, PathBuf};
use serde_json::Value;
use crate::core::config::{AssetsConfig, LanguageConfig};
use crate::core::error::{Error, Result};

/// Where a published asset lives, as the ordered values of the configured keys
/// (`["uid", "filename"]` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPath {
    pub segments: Vec<String>,
}

impl AssetPath {
    /// The `uid` key prefers `_metadata.object_id` over the asset uid.
    pub fn from_asset(asset: &Value, keys: &[String]) -> Result<Self> {
        let segments = keys
            .iter()
            .map(|key| {
                let value = if key == "uid" {
                    asset
                        .pointer("/_metadata/object_id")
                        .filter(|id| is_segment(id))
                        .or_else(|| asset.get("uid"))
                } else {
                    asset.get(key)
                };
                value
                    .filter(|value| is_segment(value))
                    .map(segment_text)
                    .ok_or_else(|| Error::invalid_argument(format!("'{}' key is undefined in asset object", key)))
            })
            .collect::<Result<Vec<_>>>()?;
        if segments.iter().any(|segment| segment == "." || segment == ".." || segment.contains(['/', '\\'])) {
            return Err(Error::invalid_argument(format!("Asset path {:?} escapes the asset root", segments)));
        }
        Ok(AssetPath { segments })
    }

    pub fn relative(&self) -> String {
        self.segments.join("/")
    }

    pub fn under(&self, root: &Path) -> PathBuf {
        self.segments.iter().fold(root.to_path_buf(), |path, segment| path.join(segment))
    }

    /// Object-store key: `<locale>/<segments>`.
    pub fn object_key(&self, locale: &str) -> String {
        format!("{}/{}", locale, self.relative())
    }

    /// Public url of the asset. Languages served under their own prefix (and
    /// without a dedicated host) get that prefix in front.
    pub fn internal_url(&self, assets: &AssetsConfig, language: &LanguageConfig) -> String {
        let url = format!("{}{}", assets.relative_url_prefix, self.relative());
        if language.relative_url_prefix == "/" || language.host.is_some() {
            return url;
        }
        let prefix = language
            .relative_url_prefix
            .strip_suffix('/')
            .unwrap_or(&language.relative_url_prefix);
        format!("{}{}", prefix, url)
    }
}

fn is_segment(value: &Value) -> bool {
    match value {
        Value::String(text) => !text.is_empty(),
        Value::Number(_) => true,
        _ => false,
    }
}

fn segment_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
