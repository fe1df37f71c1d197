use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const ARTIFACT_EXTENSION: &str = "backup";
pub const METADATA_EXTENSION: &str = "metadata";

/// Lifecycle of a run. Variant order is the forward order; `Failed` sits
/// last but is only reachable as a terminal sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Verified,
    Encrypted,
    Uploaded,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RunStatus::Failed || next > self
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Verified => "verified",
            RunStatus::Encrypted => "encrypted",
            RunStatus::Uploaded => "uploaded",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    None,
    Kms,
    PublicKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
    Unverified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRun {
    pub id: String,
    pub database_name: String,
    pub source_host: String,
    pub source_port: u16,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_size_bytes: Option<u64>,
    pub duration_seconds: Option<f64>,
    pub verification_enabled: bool,
    pub verification_passed: Option<bool>,
    pub encryption_method: EncryptionMethod,
    pub sha256: Option<String>,
    pub uploaded_destinations: BTreeSet<String>,
    #[serde(default)]
    pub destination_errors: BTreeMap<String, String>,
    pub pruned_count: Option<usize>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

impl BackupRun {
    pub fn new(
        started_at: DateTime<Utc>,
        database_name: &str,
        source_host: &str,
        source_port: u16,
        verification_enabled: bool,
    ) -> Self {
        Self {
            id: started_at.format(RUN_ID_FORMAT).to_string(),
            database_name: database_name.to_string(),
            source_host: source_host.to_string(),
            source_port,
            status: RunStatus::Pending,
            started_at,
            finished_at: None,
            artifact_path: None,
            artifact_size_bytes: None,
            duration_seconds: None,
            verification_enabled,
            verification_passed: None,
            encryption_method: EncryptionMethod::None,
            sha256: None,
            uploaded_destinations: BTreeSet::new(),
            destination_errors: BTreeMap::new(),
            pruned_count: None,
            failed_stage: None,
            error: None,
        }
    }

    pub fn verification_status(&self) -> VerificationStatus {
        match (self.verification_passed, self.verification_enabled) {
            (Some(true), _) => VerificationStatus::Passed,
            (Some(false), _) => VerificationStatus::Failed,
            (None, false) => VerificationStatus::Unverified,
            (None, true) => VerificationStatus::Pending,
        }
    }

    /// Whether the artifact may be handed to upload or retention. Requires a
    /// passed verification, or a started run when verification is disabled.
    pub fn artifact_ready(&self) -> bool {
        if self.status == RunStatus::Failed || self.artifact_path.is_none() {
            return false;
        }
        if self.verification_enabled {
            self.status >= RunStatus::Verified && self.verification_passed == Some(true)
        } else {
            self.status >= RunStatus::Running
        }
    }

    /// `{prefix}_{database}_`, the name stem shared by every file of this
    /// database's runs.
    pub fn name_stem(prefix: &str, database: &str) -> String {
        format!("{}_{}_", prefix, database)
    }

    pub fn artifact_file_name(&self, prefix: &str) -> String {
        format!(
            "{}{}.{}",
            Self::name_stem(prefix, &self.database_name),
            self.id,
            ARTIFACT_EXTENSION
        )
    }

    pub fn metadata_file_name(&self, prefix: &str) -> String {
        format!(
            "{}{}.{}",
            Self::name_stem(prefix, &self.database_name),
            self.id,
            METADATA_EXTENSION
        )
    }
}

/// Reads the run timestamp embedded in a file name that starts with `stem`.
/// The timestamp must follow the stem directly and end the name or be
/// followed by an extension.
pub fn embedded_timestamp(name: &str, stem: &str) -> Option<DateTime<Utc>> {
    let rest = name.strip_prefix(stem)?;
    let stamp = rest.get(..15)?;
    let tail = &rest[15..];
    if !(tail.is_empty() || tail.starts_with('.')) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, RUN_ID_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The serialized metadata record: every run field plus the derived
/// `verification_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(flatten)]
    pub run: BackupRun,
    pub verification_status: VerificationStatus,
}

impl From<&BackupRun> for MetadataDocument {
    fn from(run: &BackupRun) -> Self {
        Self {
            run: run.clone(),
            verification_status: run.verification_status(),
        }
    }
}
