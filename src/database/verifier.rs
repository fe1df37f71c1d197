use super::driver::ArtifactVerifier;
use crate::backup::archive::{read_back_bundle, ArtifactKind};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lists the artifact's table of contents with `pg_restore --list`. Nothing
/// is restored.
pub struct PgRestoreVerifier {
    pg_restore: PathBuf,
}

impl Default for PgRestoreVerifier {
    fn default() -> Self {
        let pg_restore = which::which("pg_restore").unwrap_or_else(|_| PathBuf::from("pg_restore"));
        Self { pg_restore }
    }
}

impl PgRestoreVerifier {
    pub fn with_binary(pg_restore: PathBuf) -> Self {
        Self { pg_restore }
    }

    async fn list_toc(&self, target: &Path) -> Result<usize, String> {
        let output = Command::new(&self.pg_restore)
            .arg("--list")
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to execute pg_restore: {}", e))?;

        if !output.status.success() {
            return Err(format!(
                "pg_restore --list exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let entries = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with(';'))
            .count();
        Ok(entries)
    }

    async fn check(&self, artifact: &Path) -> Result<usize, String> {
        let kind = ArtifactKind::detect(artifact).map_err(|e| e.to_string())?;
        debug!("Artifact {} detected as {:?}", artifact.display(), kind);

        match kind {
            ArtifactKind::CustomDump => self.list_toc(artifact).await,
            ArtifactKind::DirectoryBundle => {
                let toc_dir = toc_scratch_dir(artifact);
                let result = match read_back_bundle(artifact, &toc_dir) {
                    Ok(_) => self.list_toc(&toc_dir).await,
                    Err(e) => Err(e.to_string()),
                };
                let _ = std::fs::remove_dir_all(&toc_dir);
                result
            }
            ArtifactKind::Unknown => Err("unrecognised artifact format".to_string()),
        }
    }
}

#[async_trait]
impl ArtifactVerifier for PgRestoreVerifier {
    async fn verify(&self, artifact: &Path) -> bool {
        match self.check(artifact).await {
            Ok(entries) => {
                info!("Verified {}: {} TOC entries", artifact.display(), entries);
                entries > 0
            }
            Err(reason) => {
                warn!("Verification of {} failed: {}", artifact.display(), reason);
                false
            }
        }
    }
}

/// Scratch directory a bundled artifact's table of contents is extracted to.
pub fn toc_scratch_dir(artifact: &Path) -> PathBuf {
    let mut name = OsString::from(artifact.as_os_str());
    name.push(".toc");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unknown_format_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.backup");
        std::fs::write(&path, b"not a dump at all").unwrap();

        let verifier = PgRestoreVerifier::with_binary(PathBuf::from("pg_restore"));
        assert!(!verifier.verify(&path).await);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_verification() {
        let dir = tempdir().unwrap();
        let verifier = PgRestoreVerifier::with_binary(PathBuf::from("pg_restore"));
        assert!(!verifier.verify(&dir.path().join("missing.backup")).await);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.backup");
        std::fs::write(&path, b"PGDMP\x01\x0e\x00rest").unwrap();

        let verifier = PgRestoreVerifier::with_binary(dir.path().join("no-such-pg_restore"));
        assert!(!verifier.verify(&path).await);
    }

    #[tokio::test]
    async fn test_corrupt_bundle_fails_and_cleans_scratch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.backup");
        std::fs::write(&path, b"PK\x03\x04truncated").unwrap();

        let verifier = PgRestoreVerifier::with_binary(dir.path().join("no-such-pg_restore"));
        assert!(!verifier.verify(&path).await);
        assert!(!toc_scratch_dir(&path).exists());
    }
}
