pub mod backend;
pub mod file_lock;
pub mod partition_cache;
pub mod file;
pub mod embedded;
pub mod networked;

use std::sync::Arc;
use tracing::info;
use crate::core::config::{Config, Provider};
use crate::core::error::Result;
use crate::index::in_memory::InMemoryIndex;
use backend::StorageBackend;
use embedded::EmbeddedBackend;
use file::FileBackend;
use networked::NetworkedBackend;

/// Open the configured provider. All backends share `index`.
pub async fn open_backend(config: &Config, index: Arc<InMemoryIndex>) -> Result<Arc<dyn StorageBackend>> {
    info!(provider = ?config.storage.provider, "opening storage backend");
    let backend: Arc<dyn StorageBackend> = match config.storage.provider {
        Provider::File => Arc::new(FileBackend::open(config, index).await?),
        Provider::Embedded => Arc::new(EmbeddedBackend::open(config, index).await?),
        Provider::Networked => Arc::new(NetworkedBackend::open(&config.storage.networked, index).await?),
    };
    Ok(backend)
}
