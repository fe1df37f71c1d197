use crate::error::{BackupError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Encrypts to a recipient's public key with `gpg`.
pub struct GpgEncryptor {
    recipient: String,
    binary: PathBuf,
}

impl GpgEncryptor {
    pub fn new(recipient: &str) -> Self {
        let binary = which::which("gpg").unwrap_or_else(|_| PathBuf::from("gpg"));
        Self {
            recipient: recipient.to_string(),
            binary,
        }
    }

    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = binary;
        self
    }

    pub async fn encrypt_file(&self, source: &Path, dest: &Path) -> Result<()> {
        debug!("gpg encrypting {} for {}", source.display(), self.recipient);
        let output = Command::new(&self.binary)
            .arg("--batch")
            .arg("--yes")
            .arg("--trust-model")
            .arg("always")
            .arg("--recipient")
            .arg(&self.recipient)
            .arg("--output")
            .arg(dest)
            .arg("--encrypt")
            .arg(source)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Encryption(format!("failed to execute gpg: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::Encryption(format!(
                "gpg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
