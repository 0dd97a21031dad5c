use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};
use crate::assets::download::{AssetDownloader, ObjectStore};
use crate::assets::path::AssetPath;
use crate::assets::scanner::AssetScanner;
use crate::core::config::LanguageConfig;
use crate::core::error::{Error, Result};
use crate::core::store::ContentStore;
use crate::core::types::{CachedCollection, Partition, ASSETS};
use crate::query::types::{BulkDelete, RemoveRequest, WriteRequest};
use crate::schema::schema::ContentTypeSchema;

/// Where asset binaries are kept.
#[derive(Clone)]
pub enum AssetTarget {
    Local,                       // Under each language's `assets_path`
    Remote(Arc<dyn ObjectStore>), // `<locale>/<asset path>` keys
}

/// Keeps asset records and their binaries in step across publish, unpublish
/// and delete events.
pub struct AssetPipeline {
    store: Arc<ContentStore>,
    downloader: Arc<dyn AssetDownloader>,
    target: AssetTarget,
    scanner: AssetScanner,
}

impl AssetPipeline {
    pub fn new(store: Arc<ContentStore>, downloader: Arc<dyn AssetDownloader>, target: AssetTarget) -> Result<Self> {
        Ok(AssetPipeline {
            store,
            downloader,
            target,
            scanner: AssetScanner::new()?,
        })
    }

    pub fn scanner(&self) -> &AssetScanner {
        &self.scanner
    }

    /// Store a published asset, downloading its binary unless the stored copy
    /// is identical and present. Returns the record as stored.
    pub async fn publish(&self, asset: Value, locale: &str) -> Result<Value> {
        let Value::Object(mut asset) = asset else {
            return Err(Error::invalid_argument("Asset must be a JSON object"));
        };
        let language = self.store.config().language(locale)?.clone();
        let uid = asset
            .get("uid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_argument("Asset has no uid"))?;

        if asset.contains_key("download_id") {
            return self.publish_in_text(Value::Object(asset), &language).await;
        }

        let force_load = asset
            .remove("force_load")
            .and_then(|flag| flag.as_bool())
            .unwrap_or(false);
        for key in ["ACL", "app_user_object_uid", "publish_details"] {
            asset.remove(key);
        }
        let mut asset = Value::Object(asset);

        let config = &self.store.config().assets;
        let path = AssetPath::from_asset(&asset, &config.keys)?;
        asset["_internal_url"] = Value::String(path.internal_url(config, &language));

        if !config.download {
            self.save(&asset, &uid, locale).await?;
            return Ok(asset);
        }

        let previous = self.stored(locale, &uid);
        if !force_load && previous.as_ref() == Some(&asset) && self.exists(&path, &language).await? {
            debug!(locale, uid = %uid, "asset unchanged");
            return Ok(asset);
        }

        if let Some(previous) = &previous {
            if !self.referenced_in_text(locale, previous) {
                match AssetPath::from_asset(previous, &config.keys) {
                    Ok(old) => self.discard(&old, &language).await,
                    Err(e) => warn!(locale, uid = %uid, error = %e, "previous asset path unknown"),
                }
            }
        }

        let url = origin_url(&asset)?;
        let download = self.downloader.download(&url).await?;
        self.write(&path, &language, download.body).await?;
        self.save(&asset, &uid, locale).await?;
        info!(locale, uid = %uid, path = %path.relative(), "asset published");
        Ok(asset)
    }

    /// Assets found inside rich text are stored under their download id; the
    /// filename comes from the origin response.
    async fn publish_in_text(&self, mut asset: Value, language: &LanguageConfig) -> Result<Value> {
        let locale = language.code.as_str();
        let download_id = asset
            .get("download_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_argument("download_id must be a string"))?;
        let url = origin_url(&asset)?;

        let known = self.records(locale).into_iter().find(|stored| {
            stored.get("download_id").and_then(Value::as_str) == Some(download_id.as_str())
                && stored.get("url").and_then(Value::as_str) == Some(url.as_str())
        });
        if let Some(known) = known {
            debug!(locale, download_id = %download_id, "in-text asset already stored");
            return Ok(known);
        }

        let download = self.downloader.download(&url).await?;
        if let Some(filename) = download.filename {
            asset["filename"] = Value::String(filename);
        }
        let config = &self.store.config().assets;
        let path = AssetPath::from_asset(&asset, &config.keys)?;
        asset["_internal_url"] = Value::String(path.internal_url(config, language));

        self.write(&path, language, download.body).await?;
        self.save(&asset, &download_id, locale).await?;
        info!(locale, download_id = %download_id, path = %path.relative(), "in-text asset published");
        Ok(asset)
    }

    /// Drop an asset record, and its binary unless rich text still points at it.
    pub async fn unpublish(&self, asset_uid: &str, locale: &str) -> Result<()> {
        let language = self.store.config().language(locale)?.clone();
        let Some(previous) = self.stored(locale, asset_uid) else {
            debug!(locale, uid = asset_uid, "unpublish of unknown asset");
            return Ok(());
        };

        if !self.referenced_in_text(locale, &previous) {
            match AssetPath::from_asset(&previous, &self.store.config().assets.keys) {
                Ok(path) => self.discard(&path, &language).await,
                Err(e) => warn!(locale, uid = asset_uid, error = %e, "asset path unknown, binary kept"),
            }
        }
        self.store.remove(RemoveRequest::records(ASSETS, locale, &[asset_uid])).await?;
        info!(locale, uid = asset_uid, "asset unpublished");
        Ok(())
    }

    /// Remove every stored version of an asset: its folder and all records with its uid.
    pub async fn delete_asset(&self, asset_uid: &str, locale: &str) -> Result<()> {
        let language = self.store.config().language(locale)?.clone();
        if asset_uid.is_empty() || asset_uid.contains(['/', '\\']) || asset_uid == "." || asset_uid == ".." {
            return Err(Error::invalid_argument(format!("Invalid asset uid '{}'", asset_uid)));
        }

        match &self.target {
            AssetTarget::Local => {
                let folder = language.assets_path.join(asset_uid);
                match tokio::fs::remove_dir_all(&folder).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::storage(format!("Removing {}", folder.display()), e)),
                }
            }
            AssetTarget::Remote(objects) => {
                let keys = objects.list_objects(&format!("{}/{}", locale, asset_uid)).await?;
                for key in &keys {
                    objects.delete_object(key).await?;
                }
                debug!(locale, uid = asset_uid, objects = keys.len(), "asset objects deleted");
            }
        }

        let request = BulkDelete::new(
            Partition::new(ASSETS, locale),
            "uid",
            vec![Value::String(asset_uid.to_string())],
        );
        self.store.bulk_delete(request).await?;
        info!(locale, uid = asset_uid, "asset deleted");
        Ok(())
    }

    /// Rewrite an entry's asset urls against the assets stored for `locale`.
    pub fn rewrite_entry(&self, content_type: &ContentTypeSchema, entry: &mut Value, locale: &str) {
        let stored: HashMap<String, Value> = self
            .store
            .index()
            .records(&Partition::new(ASSETS, locale))
            .unwrap_or_default()
            .into_iter()
            .map(|record| (record.uid, record.data))
            .collect();
        let download = self.store.config().assets.download;
        self.scanner.rewrite_asset_urls(&content_type.schema, entry, &stored, download);
    }

    fn stored(&self, locale: &str, uid: &str) -> Option<Value> {
        self.store
            .index()
            .get(locale, CachedCollection::Assets, uid)
            .map(|record| record.data)
    }

    fn records(&self, locale: &str) -> Vec<Value> {
        self.store
            .index()
            .records(&Partition::new(ASSETS, locale))
            .unwrap_or_default()
            .into_iter()
            .map(|record| record.data)
            .collect()
    }

    /// True when an in-text copy shares the asset's uid and filename, and so its file.
    fn referenced_in_text(&self, locale: &str, asset: &Value) -> bool {
        let uid = asset.get("uid");
        let filename = asset.get("filename");
        self.records(locale).iter().any(|stored| {
            stored.get("download_id").is_some() && stored.get("uid") == uid && stored.get("filename") == filename
        })
    }

    async fn save(&self, asset: &Value, uid: &str, locale: &str) -> Result<()> {
        self.store
            .upsert(WriteRequest::new(ASSETS, locale, uid, asset.clone()))
            .await?;
        Ok(())
    }

    async fn exists(&self, path: &AssetPath, language: &LanguageConfig) -> Result<bool> {
        match &self.target {
            AssetTarget::Local => Ok(tokio::fs::try_exists(path.under(&language.assets_path)).await?),
            AssetTarget::Remote(objects) => {
                let key = path.object_key(&language.code);
                Ok(objects.list_objects(&key).await?.contains(&key))
            }
        }
    }

    async fn write(&self, path: &AssetPath, language: &LanguageConfig, body: Bytes) -> Result<()> {
        match &self.target {
            AssetTarget::Local => {
                let file = path.under(&language.assets_path);
                write_file(&file, &body).await
            }
            AssetTarget::Remote(objects) => objects.put_object(&path.object_key(&language.code), body).await,
        }
    }

    /// Best effort: a binary that cannot be removed is only logged.
    async fn discard(&self, path: &AssetPath, language: &LanguageConfig) {
        let outcome = match &self.target {
            AssetTarget::Local => match tokio::fs::remove_file(path.under(&language.assets_path)).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other.map_err(Error::from),
            },
            AssetTarget::Remote(objects) => objects.delete_object(&path.object_key(&language.code)).await,
        };
        if let Err(e) = outcome {
            warn!(locale = %language.code, path = %path.relative(), error = %e, "stale asset not removed");
        }
    }
}

fn origin_url(asset: &Value) -> Result<String> {
    asset
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument("Asset has no origin url"))
}

async fn write_file(file: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::storage(format!("Creating {}", parent.display()), e))?;
    }
    tokio::fs::write(file, body)
        .await
        .map_err(|e| Error::storage(format!("Writing {}", file.display()), e))
}
