use super::{object_key, ObjectStore, StoredObject};
use crate::config::{DestinationConfig, StorageProvider};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::debug;

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// S3 API client; also serves Google Cloud Storage through its
/// S3-interoperable XML endpoint with HMAC keys.
pub struct S3Store {
    config: DestinationConfig,
    client: OnceCell<s3::Client>,
}

impl S3Store {
    pub fn new(config: &DestinationConfig) -> Self {
        Self {
            config: config.clone(),
            client: OnceCell::new(),
        }
    }

    fn endpoint(&self) -> Option<String> {
        match (&self.config.endpoint_url, self.config.provider) {
            (Some(url), _) => Some(url.clone()),
            (None, StorageProvider::Gcs) => Some(GCS_ENDPOINT.to_string()),
            (None, _) => None,
        }
    }

    async fn client(&self) -> &s3::Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
                let region = self.config.region.clone().unwrap_or_else(|| match self.config.provider {
                    StorageProvider::Gcs => "auto".to_string(),
                    _ => "us-east-1".to_string(),
                });
                loader = loader.region(Region::new(region));
                if let Some(endpoint) = self.endpoint() {
                    loader = loader.endpoint_url(endpoint);
                }
                if let (Some(key), Some(secret)) =
                    (&self.config.access_key_id, &self.config.secret_access_key)
                {
                    loader = loader.credentials_provider(s3::config::Credentials::new(
                        key, secret, None, None, "Static",
                    ));
                }
                let sdk_config = loader.load().await;
                let s3_config = s3::config::Builder::from(&sdk_config)
                    .force_path_style(self.config.endpoint_url.is_some())
                    .build();
                s3::Client::from_conf(s3_config)
            })
            .await
    }

    fn key(&self, name: &str) -> String {
        object_key(&self.config.path_prefix, name)
    }

    fn storage_err<E>(&self, action: &str, name: &str, err: E) -> BackupError
    where
        E: std::error::Error,
    {
        BackupError::Storage(format!(
            "{} {} in {} failed: {}",
            action,
            name,
            self.config.bucket,
            DisplayErrorContext(err)
        ))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn id(&self) -> String {
        self.config.id()
    }

    async fn put(&self, name: &str, source: &Path) -> Result<()> {
        let key = self.key(name);
        debug!("PUT s3://{}/{}", self.config.bucket, key);
        let body = ByteStream::from_path(source).await.map_err(|e| {
            BackupError::Storage(format!("cannot read {}: {}", source.display(), e))
        })?;

        self.client()
            .await
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.storage_err("upload of", name, e))?;
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<u64>> {
        let result = self
            .client()
            .await
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.key(name))
            .send()
            .await;

        match result {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(self.storage_err("stat of", name, e))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let key_prefix = self.key(prefix);
        let strip = self.key("");
        let mut objects = Vec::new();
        let mut pages = self
            .client()
            .await
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(&key_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| self.storage_err("listing", prefix, e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.strip_prefix(strip.as_str()).unwrap_or(key);
                if name.contains('/') {
                    continue;
                }
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
                objects.push(StoredObject {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                });
            }
        }
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.client()
            .await
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| self.storage_err("delete of", name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(provider: StorageProvider, endpoint: Option<&str>) -> DestinationConfig {
        DestinationConfig {
            provider,
            bucket: "db-backups".to_string(),
            path_prefix: "prod/".to_string(),
            region: None,
            endpoint_url: endpoint.map(str::to_string),
            access_key_id: None,
            secret_access_key: None,
        }
    }

    #[test]
    fn test_gcs_defaults_to_interop_endpoint() {
        let store = S3Store::new(&dest(StorageProvider::Gcs, None));
        assert_eq!(store.endpoint().as_deref(), Some(GCS_ENDPOINT));
        let store = S3Store::new(&dest(StorageProvider::S3, None));
        assert_eq!(store.endpoint(), None);
        let store = S3Store::new(&dest(StorageProvider::S3, Some("https://fra1.digitaloceanspaces.com")));
        assert_eq!(store.endpoint().as_deref(), Some("https://fra1.digitaloceanspaces.com"));
    }

    #[test]
    fn test_keys_carry_path_prefix() {
        let store = S3Store::new(&dest(StorageProvider::S3, None));
        assert_eq!(store.key("a.backup"), "prod/a.backup");
        assert_eq!(store.id(), "s3:db-backups/prod");
    }
}
