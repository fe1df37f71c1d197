mod filesystem;
mod s3;

pub use filesystem::FilesystemStore;
pub use s3::S3Store;

use crate::config::{DestinationConfig, StorageProvider};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object name relative to the store's path prefix.
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Put/list/delete access to one backup location.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Identifier used in logs and metadata.
    fn id(&self) -> String;
    async fn put(&self, name: &str, source: &Path) -> Result<()>;
    /// Size of a stored object, `None` if it does not exist.
    async fn stat(&self, name: &str) -> Result<Option<u64>>;
    /// Objects whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

pub fn create_store(config: &DestinationConfig) -> Box<dyn ObjectStore> {
    match config.provider {
        StorageProvider::S3 | StorageProvider::Gcs => Box::new(S3Store::new(config)),
        StorageProvider::Filesystem => Box::new(FilesystemStore::new(
            Path::new(&config.bucket),
            &config.path_prefix,
        )),
    }
}

pub fn create_stores(destinations: &[DestinationConfig]) -> Vec<Box<dyn ObjectStore>> {
    destinations.iter().map(create_store).collect()
}

/// Joins a configured path prefix and an object name into a key.
pub fn object_key(path_prefix: &str, name: &str) -> String {
    let prefix = path_prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
