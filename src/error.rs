use std::fmt;
use std::io;

#[derive(Debug)]
pub enum BackupError {
    ConfigInvalid(String),
    SourceUnreachable(String),
    DumpFailed(String),
    VerificationFailed(String),
    EncryptionUnavailable(String),
    Encryption(String),
    AllUploadsFailed(Vec<(String, String)>),
    Storage(String),
    Prune(String),
    Notify(String),
    Metadata(String),
    AlreadyRunning(String),
    Interrupted,
    Io(io::Error),
    Serialization(String),
}

impl BackupError {
    /// Process exit status for a run that terminated with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::ConfigInvalid(_) => 2,
            BackupError::SourceUnreachable(_) => 3,
            BackupError::DumpFailed(_) => 4,
            BackupError::VerificationFailed(_) => 5,
            BackupError::EncryptionUnavailable(_) => 6,
            BackupError::AllUploadsFailed(_) => 7,
            BackupError::AlreadyRunning(_) => 75,
            BackupError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Short machine-readable category, recorded in run metadata.
    pub fn category(&self) -> &'static str {
        match self {
            BackupError::ConfigInvalid(_) => "config_invalid",
            BackupError::SourceUnreachable(_) => "source_unreachable",
            BackupError::DumpFailed(_) => "dump_failed",
            BackupError::VerificationFailed(_) => "verification_failed",
            BackupError::EncryptionUnavailable(_) => "encryption_unavailable",
            BackupError::Encryption(_) => "encryption",
            BackupError::AllUploadsFailed(_) => "all_uploads_failed",
            BackupError::Storage(_) => "storage",
            BackupError::Prune(_) => "prune",
            BackupError::Notify(_) => "notify",
            BackupError::Metadata(_) => "metadata",
            BackupError::AlreadyRunning(_) => "already_running",
            BackupError::Interrupted => "interrupted",
            BackupError::Io(_) => "io",
            BackupError::Serialization(_) => "serialization",
        }
    }

    /// Whether the local artifact must survive this failure. After every
    /// upload failed the local file is the only copy left.
    pub fn preserves_artifact(&self) -> bool {
        matches!(self, BackupError::AllUploadsFailed(_))
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            BackupError::SourceUnreachable(msg) => write!(f, "Source database unreachable: {}", msg),
            BackupError::DumpFailed(msg) => write!(f, "Dump failed: {}", msg),
            BackupError::VerificationFailed(msg) => write!(f, "Verification failed: {}", msg),
            BackupError::EncryptionUnavailable(msg) => write!(f, "Encryption unavailable: {}", msg),
            BackupError::Encryption(msg) => write!(f, "Encryption error: {}", msg),
            BackupError::AllUploadsFailed(errors) => {
                write!(f, "All uploads failed")?;
                for (destination, err) in errors {
                    write!(f, "; {}: {}", destination, err)?;
                }
                Ok(())
            }
            BackupError::Storage(msg) => write!(f, "Storage error: {}", msg),
            BackupError::Prune(msg) => write!(f, "Prune error: {}", msg),
            BackupError::Notify(msg) => write!(f, "Notify error: {}", msg),
            BackupError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            BackupError::AlreadyRunning(msg) => write!(f, "Already running: {}", msg),
            BackupError::Interrupted => write!(f, "Interrupted by signal"),
            BackupError::Io(err) => write!(f, "IO error: {}", err),
            BackupError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::SourceUnreachable(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Notify(err.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::DumpFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
