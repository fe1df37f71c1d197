use crate::config::UploadSettings;
use crate::error::{BackupError, Result};
use crate::storage::ObjectStore;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct UploadReport {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
}

/// Pushes the artifact and its metadata to every destination. Destinations
/// are independent: they run concurrently and one failing does not stop
/// the others.
pub struct Uploader {
    max_attempts: u32,
    backoff: Duration,
    deadline: Option<Duration>,
}

impl Uploader {
    pub fn new(settings: &UploadSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: Duration::from_millis(settings.retry_backoff_ms),
            deadline: None,
        }
    }

    /// Bounds each destination, retries included. A destination that runs
    /// out of time counts as failed; the ones that finished keep their
    /// result.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Returns which destinations hold a confirmed copy. Fails with
    /// `AllUploadsFailed` only when destinations exist and none succeeded.
    pub async fn upload(
        &self,
        artifact: &Path,
        metadata: &Path,
        stores: &[Box<dyn ObjectStore>],
    ) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        if stores.is_empty() {
            info!("No remote destinations configured; keeping local copy only");
            return Ok(report);
        }

        let expected_size = tokio::fs::metadata(artifact).await?.len();
        let attempts = stores.iter().map(|store| async move {
            let upload = self.upload_with_retry(store.as_ref(), artifact, metadata, expected_size);
            let outcome = match self.deadline {
                Some(limit) => timeout(limit, upload).await.unwrap_or_else(|_| {
                    Err(BackupError::Storage(format!("timed out after {:?}", limit)))
                }),
                None => upload.await,
            };
            (store.id(), outcome)
        });

        for (id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    info!("Upload to {} confirmed", id);
                    report.succeeded.insert(id);
                }
                Err(e) => {
                    report.failed.insert(id, e.to_string());
                }
            }
        }

        if report.succeeded.is_empty() {
            return Err(BackupError::AllUploadsFailed(
                report.failed.into_iter().collect(),
            ));
        }
        for (id, err) in &report.failed {
            warn!("Upload to {} failed, continuing with remaining copies: {}", id, err);
        }
        Ok(report)
    }

    /// Replaces the metadata object on destinations that already hold the
    /// artifact. Best effort.
    pub async fn publish_metadata(
        &self,
        metadata: &Path,
        stores: &[Box<dyn ObjectStore>],
        destinations: &BTreeSet<String>,
    ) {
        let Some(name) = file_name(metadata) else {
            return;
        };
        let name = name.as_str();
        let puts = stores
            .iter()
            .filter(|store| destinations.contains(&store.id()))
            .map(|store| async move { (store.id(), store.put(name, metadata).await) });

        for (id, result) in join_all(puts).await {
            if let Err(e) = result {
                warn!("Could not refresh metadata on {}: {}", id, e);
            }
        }
    }

    async fn upload_with_retry(
        &self,
        store: &dyn ObjectStore,
        artifact: &Path,
        metadata: &Path,
        expected_size: u64,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match upload_once(store, artifact, metadata, expected_size).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "Upload to {} failed (attempt {}/{}): {}",
                        store.id(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

async fn upload_once(
    store: &dyn ObjectStore,
    artifact: &Path,
    metadata: &Path,
    expected_size: u64,
) -> Result<()> {
    let artifact_name = file_name(artifact)
        .ok_or_else(|| BackupError::Storage(format!("bad artifact path {}", artifact.display())))?;
    let metadata_name = file_name(metadata)
        .ok_or_else(|| BackupError::Storage(format!("bad metadata path {}", metadata.display())))?;

    store.put(&artifact_name, artifact).await?;
    match store.stat(&artifact_name).await? {
        Some(size) if size == expected_size => {}
        Some(size) => {
            return Err(BackupError::Storage(format!(
                "stored size {} does not match local size {}",
                size, expected_size
            )))
        }
        None => {
            return Err(BackupError::Storage(
                "object missing after upload".to_string(),
            ))
        }
    }

    store.put(&metadata_name, metadata).await?;
    if store.stat(&metadata_name).await?.is_none() {
        return Err(BackupError::Storage(
            "metadata missing after upload".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilesystemStore, StoredObject};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    /// Fails the first `failures` puts, then delegates.
    struct FlakyStore {
        inner: FilesystemStore,
        failures: AtomicU32,
        label: &'static str,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn id(&self) -> String {
            self.label.to_string()
        }

        async fn put(&self, name: &str, source: &Path) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BackupError::Storage("503 Slow Down".to_string()));
            }
            self.inner.put(name, source).await
        }

        async fn stat(&self, name: &str) -> Result<Option<u64>> {
            self.inner.stat(name).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.inner.delete(name).await
        }
    }

    /// Accepts puts but never stores anything.
    struct BlackHole;

    #[async_trait]
    impl ObjectStore for BlackHole {
        fn id(&self) -> String {
            "blackhole".to_string()
        }
        async fn put(&self, _name: &str, _source: &Path) -> Result<()> {
            Ok(())
        }
        async fn stat(&self, _name: &str) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<StoredObject>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn settings(max_attempts: u32) -> UploadSettings {
        UploadSettings {
            max_attempts,
            retry_backoff_ms: 1,
        }
    }

    fn flaky(dir: &Path, label: &'static str, failures: u32) -> Box<dyn ObjectStore> {
        Box::new(FlakyStore {
            inner: FilesystemStore::new(&dir.join(label), ""),
            failures: AtomicU32::new(failures),
            label,
        })
    }

    fn files(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let artifact = dir.join("backup_appdb_20260101_000000.backup");
        let metadata = dir.join("backup_appdb_20260101_000000.metadata");
        std::fs::write(&artifact, b"PGDMP payload").unwrap();
        std::fs::write(&metadata, b"{}").unwrap();
        (artifact, metadata)
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let stores = vec![flaky(dir.path(), "dest1", 10), flaky(dir.path(), "dest2", 0)];

        let report = Uploader::new(&settings(1))
            .upload(&artifact, &metadata, &stores)
            .await
            .unwrap();

        assert_eq!(report.succeeded, BTreeSet::from(["dest2".to_string()]));
        assert!(report.failed.contains_key("dest1"));
        assert!(dir.path().join("dest2/backup_appdb_20260101_000000.backup").exists());
        assert!(dir.path().join("dest2/backup_appdb_20260101_000000.metadata").exists());
    }

    #[tokio::test]
    async fn test_retries_recover_transient_failure() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let stores = vec![flaky(dir.path(), "dest1", 2)];

        let report = Uploader::new(&settings(3))
            .upload(&artifact, &metadata, &stores)
            .await
            .unwrap();
        assert!(report.succeeded.contains("dest1"));
    }

    #[tokio::test]
    async fn test_all_failed_is_error() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let stores = vec![flaky(dir.path(), "dest1", 10), flaky(dir.path(), "dest2", 10)];

        let err = Uploader::new(&settings(2))
            .upload(&artifact, &metadata, &stores)
            .await
            .unwrap_err();
        match err {
            BackupError::AllUploadsFailed(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected AllUploadsFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_put_is_not_success() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let stores: Vec<Box<dyn ObjectStore>> = vec![Box::new(BlackHole)];

        let err = Uploader::new(&settings(1))
            .upload(&artifact, &metadata, &stores)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing after upload"));
    }

    #[tokio::test]
    async fn test_no_destinations_is_vacuous_success() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let report = Uploader::new(&settings(1))
            .upload(&artifact, &metadata, &[])
            .await
            .unwrap();
        assert!(report.succeeded.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_fails_only_the_slow_destination() {
        let dir = tempdir().unwrap();
        let (artifact, metadata) = files(dir.path());
        let stores = vec![flaky(dir.path(), "dest1", 10), flaky(dir.path(), "dest2", 0)];
        let slow_retries = UploadSettings {
            max_attempts: 5,
            retry_backoff_ms: 2_000,
        };

        let report = Uploader::new(&slow_retries)
            .with_deadline(Some(Duration::from_millis(200)))
            .upload(&artifact, &metadata, &stores)
            .await
            .unwrap();

        assert_eq!(report.succeeded, BTreeSet::from(["dest2".to_string()]));
        assert!(report.failed["dest1"].contains("timed out after 200ms"));
    }
}
