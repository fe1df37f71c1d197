use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub sslmode: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            username: "postgres".to_string(),
            password: String::new(),
            sslmode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub local_backup_dir: PathBuf,
    pub name_prefix: String,
    pub compression_level: u8,
    pub parallel_jobs: u32,
    pub verify: bool,
    /// Directory holding `pg_dump` and `pg_restore`. Searched on `PATH`
    /// when unset.
    pub pg_bin_dir: Option<PathBuf>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            local_backup_dir: PathBuf::from("backups"),
            name_prefix: "backup".to_string(),
            compression_level: 6,
            parallel_jobs: 1,
            verify: true,
            pg_bin_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Zero disables pruning.
    pub max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_age_days: 7 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStrategy {
    Kms,
    PublicKey,
}

impl std::fmt::Display for EncryptionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionStrategy::Kms => write!(f, "kms"),
            EncryptionStrategy::PublicKey => write!(f, "public-key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub strategy: EncryptionStrategy,
    /// KMS key id, ARN or alias.
    pub key_id: Option<String>,
    /// Public-key recipient (key id, fingerprint or email).
    pub recipient: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: EncryptionStrategy::Kms,
            key_id: None,
            recipient: None,
            region: None,
            endpoint_url: None,
        }
    }
}

impl EncryptionConfig {
    /// The key reference the configured strategy needs, if present.
    pub fn key_ref(&self) -> Option<&str> {
        let value = match self.strategy {
            EncryptionStrategy::Kms => self.key_id.as_deref(),
            EncryptionStrategy::PublicKey => self.recipient.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    Gcs,
    Filesystem,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::S3 => write!(f, "s3"),
            StorageProvider::Gcs => write!(f, "gcs"),
            StorageProvider::Filesystem => write!(f, "filesystem"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub provider: StorageProvider,
    /// Bucket or container name; a directory path for the filesystem provider.
    pub bucket: String,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl DestinationConfig {
    /// Stable identifier used in logs, metadata and notifications.
    pub fn id(&self) -> String {
        if self.path_prefix.is_empty() {
            format!("{}:{}", self.provider, self.bucket)
        } else {
            format!(
                "{}:{}/{}",
                self.provider,
                self.bucket,
                self.path_prefix.trim_matches('/')
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub metrics_url: Option<String>,
    pub webhook_url: Option<String>,
}

/// Per-stage time limits in seconds. Absent or zero means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub preflight_secs: Option<u64>,
    pub dump_secs: Option<u64>,
    pub verify_secs: Option<u64>,
    pub encrypt_secs: Option<u64>,
    pub upload_secs: Option<u64>,
}

impl StageTimeouts {
    pub fn as_duration(secs: Option<u64>) -> Option<std::time::Duration> {
        secs.filter(|s| *s > 0).map(std::time::Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub timeouts: StageTimeouts,
    #[serde(default)]
    pub upload: UploadSettings,
}
