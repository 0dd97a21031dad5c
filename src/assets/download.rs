use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_DISPOSITION;
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};

/// A fetched asset body.
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: Option<String>, // From `Content-Disposition`, when the origin sends one
    pub body: Bytes,
}

/// Fetches asset binaries from the origin.
#[async_trait]
pub trait AssetDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Download>;
}

/// Remote object storage used instead of the local asset tree.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;
    async fn delete_object(&self, key: &str) -> Result<()>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
    access_token: Option<String>,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vellum/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpDownloader { client, access_token: None })
    }

    /// Sent as `authtoken` and `access_token` headers on every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

#[async_trait]
impl AssetDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Download> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.access_token {
            request = request.header("authtoken", token).header("access_token", token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::Download,
                format!("No file found at {} ({})", url, response.status()),
            ));
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename);
        let body = response.bytes().await?;
        debug!(url, bytes = body.len(), "asset downloaded");
        Ok(Download { filename, body })
    }
}

/// `attachment; filename=my%20photo.png` -> `my photo.png`.
pub fn disposition_filename(header: &str) -> Option<String> {
    let (_, raw) = header.split_once('=')?;
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }
    urlencoding::decode(raw).ok().map(|name| name.into_owned())
}
