use super::archive::calculate_sha256;
use super::cleanup::CleanupTracker;
use crate::config::{AppConfig, StageTimeouts};
use crate::database::{
    create_driver, create_verifier, partial_path, staging_dir, toc_scratch_dir, ArtifactVerifier,
    DatabaseDriver, DumpExecutor, DumpOptions,
};
use crate::encrypt::Encryptor;
use crate::error::{BackupError, Result};
use crate::notify::{NotifierSet, RunEvent};
use crate::retention::{prune, RetentionPolicy};
use crate::run::{BackupRun, FileMetadataStore, MetadataRecorder, MetadataStore, RunStatus};
use crate::storage::{create_stores, FilesystemStore, ObjectStore};
use crate::upload::Uploader;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Preflight,
    Dumping,
    Verifying,
    Encrypting,
    Uploading,
    Pruning,
    Completed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Preflight => "preflight",
            Stage::Dumping => "dumping",
            Stage::Verifying => "verifying",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::Pruning => "pruning",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The collaborators one run talks to.
pub struct Components {
    pub driver: Box<dyn DatabaseDriver>,
    pub verifier: Box<dyn ArtifactVerifier>,
    /// Built from the encryption config when the encrypting stage starts
    /// if left unset.
    pub encryptor: Option<Encryptor>,
    pub stores: Vec<Box<dyn ObjectStore>>,
    pub notifiers: NotifierSet,
    pub metadata_store: Box<dyn MetadataStore>,
}

impl Components {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            driver: create_driver(&config.source, config.backup.pg_bin_dir.as_deref()),
            verifier: create_verifier(config.backup.pg_bin_dir.as_deref()),
            encryptor: None,
            stores: create_stores(&config.destinations),
            notifiers: NotifierSet::from_config(&config.notify),
            metadata_store: Box::new(FileMetadataStore::new(&config.backup.local_backup_dir)),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run: BackupRun,
    pub stage: Stage,
    pub error: Option<BackupError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.stage == Stage::Completed
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, BackupError::exit_code)
    }
}

/// Runs one backup from preflight to notification. Every failure ends in a
/// `failed` record, a cleanup decision and exactly one notification.
pub struct BackupOrchestrator {
    config: AppConfig,
    components: Components,
    tracker: CleanupTracker,
    stage: Stage,
    recorder: Option<MetadataRecorder>,
}

async fn within<T, F>(
    limit: Option<Duration>,
    on_timeout: fn(String) -> BackupError,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {}s", limit.as_secs()))),
        },
        None => fut.await,
    }
}

impl BackupOrchestrator {
    pub fn new(config: AppConfig, components: Components, tracker: CleanupTracker) -> Self {
        Self {
            config,
            components,
            tracker,
            stage: Stage::Init,
            recorder: None,
        }
    }

    /// Runs to completion unless `shutdown` resolves first. The current stage
    /// is then abandoned and the run is failed with `Interrupted`, which
    /// still records, cleans up and notifies.
    pub async fn run_until<F>(mut self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let result = tokio::select! {
            result = self.execute(started_at) => result,
            () = shutdown => Err(BackupError::Interrupted),
        };
        match result {
            Ok(()) => self.complete(started_at).await,
            Err(e) => self.fail(e, started_at).await,
        }
    }

    fn enter(&mut self, stage: Stage) {
        info!("Stage: {}", stage);
        self.stage = stage;
    }

    fn recorder(&mut self) -> Result<&mut MetadataRecorder> {
        self.recorder
            .as_mut()
            .ok_or_else(|| BackupError::Metadata("run record was never created".to_string()))
    }

    async fn execute(&mut self, started_at: DateTime<Utc>) -> Result<()> {
        self.enter(Stage::Init);
        self.config.validate()?;
        let backup_dir = self.config.backup.local_backup_dir.clone();
        std::fs::create_dir_all(&backup_dir)?;

        let prefix = self.config.backup.name_prefix.clone();
        let run = BackupRun::new(
            started_at,
            &self.config.source.database,
            &self.config.source.host,
            self.config.source.port,
            self.config.backup.verify,
        );
        info!(
            "Run {} for database '{}' on {}:{}",
            run.id, run.database_name, run.source_host, run.source_port
        );
        let artifact_path = backup_dir.join(run.artifact_file_name(&prefix));
        let key = run.metadata_file_name(&prefix);
        let store = std::mem::replace(
            &mut self.components.metadata_store,
            Box::new(FileMetadataStore::new(&backup_dir)),
        );
        self.recorder = Some(MetadataRecorder::begin(run, key, store)?);

        self.enter(Stage::Preflight);
        let timeouts = self.config.timeouts.clone();
        within(
            StageTimeouts::as_duration(timeouts.preflight_secs),
            BackupError::SourceUnreachable,
            DumpExecutor::new(self.components.driver.as_ref()).probe(),
        )
        .await?;
        self.recorder()?.transition(RunStatus::Running)?;

        self.enter(Stage::Dumping);
        let partial = partial_path(&artifact_path);
        self.tracker.track(&artifact_path);
        self.tracker.track(&partial);
        self.tracker.track(&staging_dir(&partial));
        let options = DumpOptions {
            compression_level: self.config.backup.compression_level,
            parallelism: self.config.backup.parallel_jobs,
        };
        let stats = within(
            StageTimeouts::as_duration(timeouts.dump_secs),
            BackupError::DumpFailed,
            DumpExecutor::new(self.components.driver.as_ref()).execute(&artifact_path, &options),
        )
        .await?;
        match std::fs::metadata(&artifact_path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                return Err(BackupError::DumpFailed(format!(
                    "artifact {} missing or empty",
                    artifact_path.display()
                )))
            }
        }
        self.recorder()?.update(|r| {
            r.artifact_path = Some(artifact_path.clone());
            r.artifact_size_bytes = Some(stats.bytes_written);
            r.duration_seconds = Some(stats.duration_seconds);
        })?;

        self.enter(Stage::Verifying);
        if self.config.backup.verify {
            self.tracker.track(&toc_scratch_dir(&artifact_path));
            let verifier = self.components.verifier.as_ref();
            let passed = within(
                StageTimeouts::as_duration(timeouts.verify_secs),
                BackupError::VerificationFailed,
                async { Ok(verifier.verify(&artifact_path).await) },
            )
            .await?;
            self.recorder()?.update(|r| r.verification_passed = Some(passed))?;
            if !passed {
                return Err(BackupError::VerificationFailed(format!(
                    "{} could not be listed",
                    artifact_path.display()
                )));
            }
            self.recorder()?.transition(RunStatus::Verified)?;
        } else {
            warn!("Verification disabled; run will be recorded as unverified");
        }

        self.enter(Stage::Encrypting);
        let encryptor = match self.components.encryptor.take() {
            Some(encryptor) => encryptor,
            None => Encryptor::from_config(&self.config.encryption)?,
        };
        let final_path = match encryptor.output_path(&artifact_path) {
            Some(out) => {
                self.tracker.track(&out);
                let encrypted = within(
                    StageTimeouts::as_duration(timeouts.encrypt_secs),
                    BackupError::Encryption,
                    encryptor.encrypt(&artifact_path),
                )
                .await?;
                let size = std::fs::metadata(&encrypted)?.len();
                let method = encryptor.method();
                self.recorder()?.update(|r| {
                    r.artifact_path = Some(encrypted.clone());
                    r.artifact_size_bytes = Some(size);
                    r.encryption_method = method;
                })?;
                self.recorder()?.transition(RunStatus::Encrypted)?;
                encrypted
            }
            None => artifact_path.clone(),
        };
        let digest = calculate_sha256(&final_path)?;
        self.recorder()?.update(|r| r.sha256 = Some(digest))?;

        self.enter(Stage::Uploading);
        let (ready, metadata_path) = {
            let recorder = self.recorder()?;
            (recorder.run().artifact_ready(), recorder.metadata_path())
        };
        if !ready {
            return Err(BackupError::Metadata(
                "artifact is not ready for upload".to_string(),
            ));
        }
        let metadata_path = metadata_path.ok_or_else(|| {
            BackupError::Metadata("metadata record has no local file to upload".to_string())
        })?;
        let uploaded = Uploader::new(&self.config.upload)
            .with_deadline(StageTimeouts::as_duration(timeouts.upload_secs))
            .upload(&final_path, &metadata_path, &self.components.stores)
            .await;
        let report = match uploaded {
            Ok(report) => report,
            Err(e) => {
                if let BackupError::AllUploadsFailed(errors) = &e {
                    let errors: BTreeMap<String, String> = errors.iter().cloned().collect();
                    if let Err(record_err) =
                        self.recorder()?.update(|r| r.destination_errors = errors)
                    {
                        warn!("Could not record upload errors: {}", record_err);
                    }
                }
                return Err(e);
            }
        };
        self.tracker.preserve();
        self.recorder()?.update(|r| {
            r.uploaded_destinations = report.succeeded.clone();
            r.destination_errors = report.failed.clone();
        })?;
        self.recorder()?.transition(RunStatus::Uploaded)?;

        self.enter(Stage::Pruning);
        let pruned = self.prune_all(&backup_dir, &prefix).await;
        self.recorder()?.update(|r| r.pruned_count = Some(pruned))?;

        Ok(())
    }

    /// Applies retention to the local directory and every destination.
    /// Failures are logged and never fail the run.
    async fn prune_all(&self, backup_dir: &Path, prefix: &str) -> usize {
        let Some(recorder) = &self.recorder else {
            return 0;
        };
        let run = recorder.run();
        let stem = BackupRun::name_stem(prefix, &run.database_name);
        let protected = format!("{}{}", stem, run.id);
        let policy = RetentionPolicy {
            max_age_days: self.config.retention.max_age_days,
            name_prefix: stem,
        };

        let now = Utc::now();
        let local = FilesystemStore::new(backup_dir, "");
        let mut scopes: Vec<&dyn ObjectStore> = vec![&local];
        scopes.extend(self.components.stores.iter().map(|s| s.as_ref()));

        let mut total = 0;
        for scope in scopes {
            match prune(scope, &policy, &protected, now).await {
                Ok(count) => total += count,
                Err(e) => warn!("Retention skipped for {}: {}", scope.id(), e),
            }
        }
        total
    }

    async fn complete(mut self, started_at: DateTime<Utc>) -> RunOutcome {
        if let Err(e) = self
            .recorder()
            .and_then(|r| r.transition(RunStatus::Completed))
        {
            return self.fail(e, started_at).await;
        }
        self.enter(Stage::Completed);
        let Some(recorder) = &self.recorder else {
            let err = BackupError::Metadata("run record was never created".to_string());
            return self.fail(err, started_at).await;
        };
        let run = recorder.run().clone();
        match recorder.reload() {
            Ok(Some(stored)) if stored.status == run.status && stored.sha256 == run.sha256 => {}
            Ok(_) => warn!("Stored metadata for run {} does not match the run", run.id),
            Err(e) => warn!("Could not re-read metadata for run {}: {}", run.id, e),
        }

        if let Some(metadata_path) = recorder.metadata_path() {
            Uploader::new(&self.config.upload)
                .publish_metadata(
                    &metadata_path,
                    &self.components.stores,
                    &run.uploaded_destinations,
                )
                .await;
        }

        info!(
            "Backup completed: {} ({:.2} MB) on {} destination(s), {} old object(s) pruned",
            run.artifact_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            run.artifact_size_bytes.unwrap_or(0) as f64 / 1024.0 / 1024.0,
            run.uploaded_destinations.len(),
            run.pruned_count.unwrap_or(0)
        );
        self.components
            .notifiers
            .notify_terminal(&RunEvent::from_run(&run))
            .await;

        RunOutcome {
            run,
            stage: Stage::Completed,
            error: None,
        }
    }

    async fn fail(mut self, err: BackupError, started_at: DateTime<Utc>) -> RunOutcome {
        let failed_stage = self.stage;
        error!("Backup failed during {}: {}", failed_stage, err);

        if err.preserves_artifact() || self.tracker.is_preserved() {
            self.tracker.preserve();
            if let Some(path) = self
                .recorder
                .as_ref()
                .and_then(|r| r.run().artifact_path.clone())
            {
                warn!("Local artifact kept at {}", path.display());
            }
        } else {
            let removed = self.tracker.cleanup();
            if removed > 0 {
                info!("Removed {} file(s) left by the failed run", removed);
            }
        }

        let run = match self.recorder.as_mut() {
            Some(recorder) => {
                if let Err(e) = recorder.fail(&failed_stage.to_string(), &err) {
                    error!("Could not record failure: {}", e);
                }
                recorder.run().clone()
            }
            None => {
                let mut run = BackupRun::new(
                    started_at,
                    &self.config.source.database,
                    &self.config.source.host,
                    self.config.source.port,
                    self.config.backup.verify,
                );
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.failed_stage = Some(failed_stage.to_string());
                run.error = Some(format!("{}: {}", err.category(), err));
                run
            }
        };
        self.stage = Stage::Failed;

        self.components
            .notifiers
            .notify_terminal(&RunEvent::from_run(&run))
            .await;

        RunOutcome {
            run,
            stage: Stage::Failed,
            error: Some(err),
        }
    }
}
