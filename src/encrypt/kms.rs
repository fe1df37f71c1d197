use crate::config::EncryptionConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_kms as kms;
use kms::config::Region;
use kms::types::DataKeySpec;
use tracing::debug;

pub struct DataKey {
    pub plaintext: Vec<u8>,
    /// The same key encrypted under the master key; safe to store.
    pub wrapped: Vec<u8>,
}

#[async_trait]
pub trait KeyService: Send + Sync {
    async fn generate_data_key(&self, key_ref: &str) -> Result<DataKey>;
    fn name(&self) -> &'static str;
}

pub struct AwsKmsKeyService {
    region: Option<String>,
    endpoint_url: Option<String>,
}

impl AwsKmsKeyService {
    pub fn new(config: &EncryptionConfig) -> Self {
        Self {
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        }
    }

    async fn client(&self) -> kms::Client {
        let mut loader = aws_config::defaults(kms::config::BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        kms::Client::new(&loader.load().await)
    }
}

#[async_trait]
impl KeyService for AwsKmsKeyService {
    async fn generate_data_key(&self, key_ref: &str) -> Result<DataKey> {
        debug!("Requesting data key under {}", key_ref);
        let output = self
            .client()
            .await
            .generate_data_key()
            .key_id(key_ref)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| {
                BackupError::Encryption(format!(
                    "KMS GenerateDataKey for {} failed: {}",
                    key_ref,
                    kms::error::DisplayErrorContext(&e)
                ))
            })?;

        let plaintext = output
            .plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| BackupError::Encryption("KMS returned no plaintext key".to_string()))?;
        let wrapped = output
            .ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| BackupError::Encryption("KMS returned no wrapped key".to_string()))?;

        Ok(DataKey { plaintext, wrapped })
    }

    fn name(&self) -> &'static str {
        "AWS KMS"
    }
}
