mod envelope;
mod gpg;
mod kms;

pub use envelope::{read_header, EnvelopeHeader};
pub use gpg::GpgEncryptor;
pub use kms::{AwsKmsKeyService, DataKey, KeyService};

use crate::config::{EncryptionConfig, EncryptionStrategy};
use crate::error::{BackupError, Result};
use crate::run::EncryptionMethod;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Wraps the artifact in an encrypted envelope. Every variant replaces the
/// plaintext artifact: on success only the ciphertext remains.
pub enum Encryptor {
    Disabled,
    Kms {
        key_id: String,
        keys: Box<dyn KeyService>,
    },
    PublicKey(GpgEncryptor),
}

impl Encryptor {
    /// Builds the configured strategy. Enabled encryption without the
    /// strategy's key reference is `EncryptionUnavailable`.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Encryptor::Disabled);
        }
        let key_ref = config.key_ref().ok_or_else(|| {
            BackupError::EncryptionUnavailable(match config.strategy {
                EncryptionStrategy::Kms => {
                    "encryption.key_id is required for the kms strategy".to_string()
                }
                EncryptionStrategy::PublicKey => {
                    "encryption.recipient is required for the public_key strategy".to_string()
                }
            })
        })?;

        Ok(match config.strategy {
            EncryptionStrategy::Kms => Encryptor::Kms {
                key_id: key_ref.to_string(),
                keys: Box::new(AwsKmsKeyService::new(config)),
            },
            EncryptionStrategy::PublicKey => Encryptor::PublicKey(GpgEncryptor::new(key_ref)),
        })
    }

    pub fn method(&self) -> EncryptionMethod {
        match self {
            Encryptor::Disabled => EncryptionMethod::None,
            Encryptor::Kms { .. } => EncryptionMethod::Kms,
            Encryptor::PublicKey(_) => EncryptionMethod::PublicKey,
        }
    }

    /// Path the encrypted artifact will have, or `None` when disabled.
    pub fn output_path(&self, artifact: &Path) -> Option<PathBuf> {
        let suffix = match self {
            Encryptor::Disabled => return None,
            Encryptor::Kms { .. } => ".enc",
            Encryptor::PublicKey(_) => ".gpg",
        };
        let mut name = OsString::from(artifact.as_os_str());
        name.push(suffix);
        Some(PathBuf::from(name))
    }

    /// Encrypts `artifact` and deletes the plaintext. Returns the path of the
    /// artifact to use from here on.
    pub async fn encrypt(&self, artifact: &Path) -> Result<PathBuf> {
        let dest = match self.output_path(artifact) {
            Some(dest) => dest,
            None => return Ok(artifact.to_path_buf()),
        };

        let sealed = match self {
            Encryptor::Disabled => Ok(()),
            Encryptor::Kms { key_id, keys } => {
                seal_with_kms(keys.as_ref(), key_id, artifact, &dest).await
            }
            Encryptor::PublicKey(gpg) => gpg.encrypt_file(artifact, &dest).await,
        };

        if let Err(e) = sealed {
            if dest.exists() {
                let _ = fs::remove_file(&dest);
            }
            return Err(e);
        }

        if let Err(e) = fs::remove_file(artifact) {
            let _ = fs::remove_file(&dest);
            return Err(BackupError::Encryption(format!(
                "could not remove plaintext {}: {}",
                artifact.display(),
                e
            )));
        }

        info!("Encrypted artifact written to {}", dest.display());
        Ok(dest)
    }
}

async fn seal_with_kms(
    keys: &dyn KeyService,
    key_id: &str,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    info!("Requesting data key for {} from {}", key_id, keys.name());
    let data_key = keys.generate_data_key(key_id).await?;
    let header = EnvelopeHeader::new(key_id, &data_key.wrapped);
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();

    let written = dest.clone();
    tokio::task::spawn_blocking(move || {
        envelope::seal_file(&data_key.plaintext, &header, &source, &dest)
    })
    .await
    .map_err(|e| BackupError::Encryption(format!("encryption task failed: {}", e)))??;

    let stored = read_header(&written)?;
    if stored.key_id != key_id {
        warn!("Envelope header key id mismatch: {}", stored.key_id);
        return Err(BackupError::Encryption("envelope header mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedKeys {
        issued: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KeyService for FixedKeys {
        async fn generate_data_key(&self, key_ref: &str) -> Result<DataKey> {
            self.issued.lock().unwrap().push(key_ref.to_string());
            Ok(DataKey {
                plaintext: vec![3u8; 32],
                wrapped: b"wrapped-under-master".to_vec(),
            })
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct BrokenKeys;

    #[async_trait]
    impl KeyService for BrokenKeys {
        async fn generate_data_key(&self, _key_ref: &str) -> Result<DataKey> {
            Err(BackupError::Encryption("AccessDenied".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_enabled_without_key_is_unavailable() {
        let mut config = EncryptionConfig {
            enabled: true,
            ..EncryptionConfig::default()
        };
        assert!(matches!(
            Encryptor::from_config(&config),
            Err(BackupError::EncryptionUnavailable(_))
        ));

        config.strategy = EncryptionStrategy::PublicKey;
        config.key_id = Some("alias/backups".to_string());
        assert!(matches!(
            Encryptor::from_config(&config),
            Err(BackupError::EncryptionUnavailable(_))
        ));
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let encryptor = Encryptor::from_config(&EncryptionConfig::default()).unwrap();
        assert_eq!(encryptor.method(), EncryptionMethod::None);
        assert!(encryptor.output_path(Path::new("a.backup")).is_none());
    }

    #[tokio::test]
    async fn test_kms_replaces_plaintext_with_envelope() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.backup");
        fs::write(&artifact, b"PGDMP secret rows").unwrap();

        let encryptor = Encryptor::Kms {
            key_id: "alias/backups".to_string(),
            keys: Box::new(FixedKeys {
                issued: Mutex::new(Vec::new()),
            }),
        };
        let out = encryptor.encrypt(&artifact).await.unwrap();

        assert_eq!(out, dir.path().join("a.backup.enc"));
        assert!(!artifact.exists());
        let header = read_header(&out).unwrap();
        assert_eq!(header.key_id, "alias/backups");
        assert_eq!(header.wrapped_key_bytes().unwrap(), b"wrapped-under-master");

        let opened = dir.path().join("opened");
        envelope::open_file(&[3u8; 32], &out, &opened).unwrap();
        assert_eq!(fs::read(&opened).unwrap(), b"PGDMP secret rows");
    }

    #[tokio::test]
    async fn test_kms_failure_keeps_no_ciphertext() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.backup");
        fs::write(&artifact, b"PGDMP").unwrap();

        let encryptor = Encryptor::Kms {
            key_id: "alias/backups".to_string(),
            keys: Box::new(BrokenKeys),
        };
        assert!(encryptor.encrypt(&artifact).await.is_err());
        assert!(!dir.path().join("a.backup.enc").exists());
    }

    #[tokio::test]
    async fn test_gpg_failure_is_encryption_error() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.backup");
        fs::write(&artifact, b"PGDMP").unwrap();

        let encryptor = Encryptor::PublicKey(
            GpgEncryptor::new("ops@example.com").with_binary(dir.path().join("no-such-gpg")),
        );
        let err = encryptor.encrypt(&artifact).await.unwrap_err();
        assert!(matches!(err, BackupError::Encryption(_)));
        assert!(!dir.path().join("a.backup.gpg").exists());
    }
}
