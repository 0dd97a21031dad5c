use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};

/// Which storage backend the process runs against. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    File,      // One JSON array file per (locale, content type)
    Embedded,  // sled, one tree per locale
    Networked, // MongoDB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkedConfig {
    pub uri: String,
    pub db_name: String,
    pub server_selection_timeout_ms: u64,
}

impl Default for NetworkedConfig {
    fn default() -> Self {
        NetworkedConfig {
            uri: "mongodb://localhost:27017".to_string(),
            db_name: "vellum".to_string(),
            server_selection_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub provider: Provider,
    pub embedded_path: PathBuf,
    pub networked: NetworkedConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            provider: Provider::File,
            embedded_path: PathBuf::from("./_contents/db.sled"),
            networked: NetworkedConfig::default(),
        }
    }
}

/// Per-locale roots. Entries, schemas and routes live under `content_path`,
/// assets (records and binaries) under `assets_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub code: String,
    pub content_path: PathBuf,
    pub assets_path: PathBuf,
    #[serde(default = "default_language_prefix")]
    pub relative_url_prefix: String,
    #[serde(default)]
    pub host: Option<String>,
}

fn default_language_prefix() -> String {
    "/".to_string()
}

impl LanguageConfig {
    pub fn new(code: &str, base_dir: &Path) -> Self {
        LanguageConfig {
            code: code.to_string(),
            content_path: base_dir.join(code).join("data"),
            assets_path: base_dir.join(code).join("assets"),
            relative_url_prefix: default_language_prefix(),
            host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub download: bool,
    pub keys: Vec<String>,           // Path segments of a stored asset, in order
    pub relative_url_prefix: String, // Prefix of every rewritten internal url
}

impl Default for AssetsConfig {
    fn default() -> Self {
        AssetsConfig {
            download: true,
            keys: vec!["uid".to_string(), "filename".to_string()],
            relative_url_prefix: "/assets/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub languages: Vec<LanguageConfig>,
    pub cache: bool,
    pub partition_cache_size: usize, // Parsed partitions kept by the file backend
    pub assets: AssetsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            languages: vec![LanguageConfig::new("en-us", Path::new("./_contents"))],
            cache: true,
            partition_cache_size: 64,
            assets: AssetsConfig::default(),
        }
    }
}

impl Config {
    /// Config rooted at `base_dir` with one language per code.
    pub fn with_languages(base_dir: &Path, codes: &[&str]) -> Self {
        Config {
            storage: StorageConfig {
                embedded_path: base_dir.join("db.sled"),
                ..StorageConfig::default()
            },
            languages: codes.iter().map(|code| LanguageConfig::new(code, base_dir)).collect(),
            ..Config::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn language(&self, code: &str) -> Result<&LanguageConfig> {
        self.languages
            .iter()
            .find(|lang| lang.code == code)
            .ok_or_else(|| Error::invalid_argument(format!("Language '{}' is not configured", code)))
    }

    pub fn locales(&self) -> impl Iterator<Item = &str> {
        self.languages.iter().map(|lang| lang.code.as_str())
    }
}
