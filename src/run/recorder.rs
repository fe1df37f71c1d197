use super::model::{BackupRun, MetadataDocument, RunStatus};
use crate::error::{BackupError, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key-value persistence for metadata records.
pub trait MetadataStore: Send + Sync {
    /// Stores a new record; fails if `key` already holds one.
    fn insert(&self, key: &str, document: &[u8]) -> Result<()>;
    /// Replaces an existing record.
    fn update(&self, key: &str, document: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Filesystem location of the record, when it has one.
    fn path_of(&self, key: &str) -> Option<PathBuf>;
}

/// Stores each record as a file under one directory. Updates are written to a
/// sibling temp file then renamed over the record.
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl MetadataStore for FileMetadataStore {
    fn insert(&self, key: &str, document: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(key);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                BackupError::Metadata(format!("cannot create record {}: {}", path.display(), e))
            })?;
        file.write_all(document)?;
        file.sync_all()?;
        Ok(())
    }

    fn update(&self, key: &str, document: &[u8]) -> Result<()> {
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!(".{}.tmp", key));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(document)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn path_of(&self, key: &str) -> Option<PathBuf> {
        Some(self.dir.join(key))
    }
}

/// Owns the one `BackupRun` of this process and persists it after every
/// change, so observers only ever see a forward-moving status.
pub struct MetadataRecorder {
    run: BackupRun,
    key: String,
    store: Box<dyn MetadataStore>,
}

impl MetadataRecorder {
    /// Writes the initial record. Fails if a record with the same run id
    /// already exists.
    pub fn begin(run: BackupRun, key: String, store: Box<dyn MetadataStore>) -> Result<Self> {
        let recorder = Self { run, key, store };
        let bytes = recorder.encode()?;
        recorder.store.insert(&recorder.key, &bytes)?;
        debug!("Metadata record {} created", recorder.key);
        Ok(recorder)
    }

    pub fn run(&self) -> &BackupRun {
        &self.run
    }

    /// Reads this run's record back from the store.
    pub fn reload(&self) -> Result<Option<BackupRun>> {
        Self::load(self.store.as_ref(), &self.key)
    }

    pub fn metadata_path(&self) -> Option<PathBuf> {
        self.store.path_of(&self.key)
    }

    /// Applies field changes without moving the status.
    pub fn update<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BackupRun),
    {
        self.ensure_open()?;
        change(&mut self.run);
        self.persist()
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        self.ensure_open()?;
        if !self.run.status.can_transition_to(next) {
            return Err(BackupError::Metadata(format!(
                "illegal status transition {} -> {}",
                self.run.status, next
            )));
        }
        debug!("Run {}: {} -> {}", self.run.id, self.run.status, next);
        self.run.status = next;
        if next.is_terminal() {
            self.run.finished_at = Some(Utc::now());
        }
        self.persist()
    }

    /// Moves the run to `failed`, recording which stage failed and why.
    pub fn fail(&mut self, stage: &str, error: &BackupError) -> Result<()> {
        self.ensure_open()?;
        self.run.failed_stage = Some(stage.to_string());
        self.run.error = Some(format!("{}: {}", error.category(), error));
        self.transition(RunStatus::Failed)
    }

    /// Decodes the stored record for `key`.
    pub fn load(store: &dyn MetadataStore, key: &str) -> Result<Option<BackupRun>> {
        match store.get(key)? {
            Some(bytes) => {
                let doc: MetadataDocument = serde_json::from_slice(&bytes)?;
                Ok(Some(doc.run))
            }
            None => Ok(None),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.run.status.is_terminal() {
            return Err(BackupError::Metadata(format!(
                "run {} is {} and its record is sealed",
                self.run.id, self.run.status
            )));
        }
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&MetadataDocument::from(&self.run))?)
    }

    fn persist(&self) -> Result<()> {
        let bytes = self.encode()?;
        self.store.update(&self.key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::model::EncryptionMethod;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn new_run() -> BackupRun {
        BackupRun::new(Utc::now(), "appdb", "localhost", 5432, true)
    }

    #[test]
    fn test_begin_refuses_duplicate_run_id() {
        let dir = tempdir().unwrap();
        let run = new_run();
        let key = run.metadata_file_name("backup");
        MetadataRecorder::begin(run.clone(), key.clone(), Box::new(FileMetadataStore::new(dir.path())))
            .unwrap();
        let second =
            MetadataRecorder::begin(run, key, Box::new(FileMetadataStore::new(dir.path())));
        assert!(matches!(second, Err(BackupError::Metadata(_))));
    }

    #[test]
    fn test_every_change_is_persisted() {
        let dir = tempdir().unwrap();
        let run = new_run();
        let key = run.metadata_file_name("backup");
        let mut recorder =
            MetadataRecorder::begin(run, key.clone(), Box::new(FileMetadataStore::new(dir.path())))
                .unwrap();

        recorder.transition(RunStatus::Running).unwrap();
        recorder
            .update(|r| {
                r.artifact_path = Some(PathBuf::from("/var/backups/a.backup"));
                r.artifact_size_bytes = Some(4096);
            })
            .unwrap();

        let store = FileMetadataStore::new(dir.path());
        let loaded = MetadataRecorder::load(&store, &key).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.artifact_size_bytes, Some(4096));
    }

    #[test]
    fn test_completed_record_roundtrips_and_is_sealed() {
        let dir = tempdir().unwrap();
        let run = new_run();
        let key = run.metadata_file_name("backup");
        let mut recorder =
            MetadataRecorder::begin(run, key.clone(), Box::new(FileMetadataStore::new(dir.path())))
                .unwrap();

        recorder.transition(RunStatus::Running).unwrap();
        recorder
            .update(|r| {
                r.verification_passed = Some(true);
                r.encryption_method = EncryptionMethod::Kms;
                r.sha256 = Some("ab".repeat(32));
                r.duration_seconds = Some(12.5);
                r.uploaded_destinations.insert("s3:primary".to_string());
                r.destination_errors
                    .insert("gcs:offsite".to_string(), "403".to_string());
                r.pruned_count = Some(2);
            })
            .unwrap();
        recorder.transition(RunStatus::Verified).unwrap();
        recorder.transition(RunStatus::Encrypted).unwrap();
        recorder.transition(RunStatus::Uploaded).unwrap();
        recorder.transition(RunStatus::Completed).unwrap();

        let store = FileMetadataStore::new(dir.path());
        let loaded = MetadataRecorder::load(&store, &key).unwrap().unwrap();
        assert_eq!(&loaded, recorder.run());
        assert!(loaded.finished_at.is_some());

        assert!(recorder.update(|r| r.pruned_count = Some(9)).is_err());
        assert!(recorder.transition(RunStatus::Failed).is_err());
        let reloaded = MetadataRecorder::load(&store, &key).unwrap().unwrap();
        assert_eq!(reloaded.pruned_count, Some(2));
    }

    #[test]
    fn test_fail_records_stage_and_category() {
        let dir = tempdir().unwrap();
        let run = new_run();
        let key = run.metadata_file_name("backup");
        let mut recorder =
            MetadataRecorder::begin(run, key, Box::new(FileMetadataStore::new(dir.path())))
                .unwrap();
        recorder.transition(RunStatus::Running).unwrap();
        recorder
            .fail("verifying", &BackupError::VerificationFailed("truncated".into()))
            .unwrap();

        let run = recorder.run();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_stage.as_deref(), Some("verifying"));
        assert!(run.error.as_deref().unwrap().starts_with("verification_failed"));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let dir = tempdir().unwrap();
        let run = new_run();
        let key = run.metadata_file_name("backup");
        let mut recorder =
            MetadataRecorder::begin(run, key, Box::new(FileMetadataStore::new(dir.path())))
                .unwrap();
        recorder.transition(RunStatus::Verified).unwrap();
        assert!(recorder.transition(RunStatus::Running).is_err());
        assert_eq!(recorder.run().status, RunStatus::Verified);
    }
}
