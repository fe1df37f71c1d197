mod driver;
mod postgres;
mod verifier;

pub use driver::{ArtifactVerifier, DatabaseDriver, DumpOptions, DumpStats};
pub use postgres::{staging_dir, PostgresDriver};
pub use verifier::{toc_scratch_dir, PgRestoreVerifier};

use crate::config::SourceConfig;
use crate::error::{BackupError, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub fn create_driver(config: &SourceConfig, bin_dir: Option<&Path>) -> Box<dyn DatabaseDriver> {
    let driver = PostgresDriver::new(config);
    match bin_dir {
        Some(dir) => Box::new(driver.with_pg_dump(dir.join("pg_dump"))),
        None => Box::new(driver),
    }
}

pub fn create_verifier(bin_dir: Option<&Path>) -> Box<dyn ArtifactVerifier> {
    match bin_dir {
        Some(dir) => Box::new(PgRestoreVerifier::with_binary(dir.join("pg_restore"))),
        None => Box::new(PgRestoreVerifier::default()),
    }
}

/// Where a dump is written before it is renamed into place.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

/// Runs the database export into `output`. The file only appears at
/// `output` once the tool succeeded and wrote a non-empty dump.
pub struct DumpExecutor<'a> {
    driver: &'a dyn DatabaseDriver,
}

impl<'a> DumpExecutor<'a> {
    pub fn new(driver: &'a dyn DatabaseDriver) -> Self {
        Self { driver }
    }

    pub async fn probe(&self) -> Result<()> {
        self.driver.test_connection().await.map_err(|e| match e {
            BackupError::SourceUnreachable(_) | BackupError::ConfigInvalid(_) => e,
            other => BackupError::SourceUnreachable(other.to_string()),
        })
    }

    pub async fn execute(&self, output: &Path, options: &DumpOptions) -> Result<DumpStats> {
        let partial = partial_path(output);
        discard(&partial);

        info!(
            "Dumping with {} into {} (compression {}, {} worker(s))",
            self.driver.engine_name(),
            output.display(),
            options.compression_level,
            options.parallelism
        );
        let start = Instant::now();

        if let Err(e) = self.driver.dump(&partial, options).await {
            discard(&partial);
            return Err(match e {
                BackupError::DumpFailed(_) => e,
                other => BackupError::DumpFailed(other.to_string()),
            });
        }

        let bytes_written = match fs::metadata(&partial) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(BackupError::DumpFailed(format!(
                    "dump produced no file: {}",
                    e
                )))
            }
        };
        if bytes_written == 0 {
            discard(&partial);
            return Err(BackupError::DumpFailed("dump produced zero bytes".to_string()));
        }

        if let Err(e) = fs::rename(&partial, output) {
            discard(&partial);
            return Err(BackupError::DumpFailed(format!(
                "cannot move dump into place: {}",
                e
            )));
        }

        let duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "Dump complete: {:.2} MB in {:.1}s",
            bytes_written as f64 / 1024.0 / 1024.0,
            duration_seconds
        );
        Ok(DumpStats {
            bytes_written,
            duration_seconds,
        })
    }
}

fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct ScriptedDriver {
        payload: Option<Vec<u8>>,
        reachable: bool,
    }

    #[async_trait]
    impl DatabaseDriver for ScriptedDriver {
        async fn test_connection(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(BackupError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }

        async fn dump(&self, output: &Path, _options: &DumpOptions) -> Result<()> {
            match &self.payload {
                Some(bytes) => {
                    fs::write(output, bytes)?;
                    Ok(())
                }
                None => {
                    fs::write(output, b"half")?;
                    Err(BackupError::DumpFailed("exit status 1".to_string()))
                }
            }
        }

        fn engine_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn options() -> DumpOptions {
        DumpOptions {
            compression_level: 6,
            parallelism: 1,
        }
    }

    #[tokio::test]
    async fn test_successful_dump_is_renamed_into_place() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a.backup");
        let driver = ScriptedDriver {
            payload: Some(b"PGDMP data".to_vec()),
            reachable: true,
        };

        let stats = DumpExecutor::new(&driver).execute(&out, &options()).await.unwrap();
        assert_eq!(stats.bytes_written, 10);
        assert!(out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_file() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a.backup");
        let driver = ScriptedDriver {
            payload: None,
            reachable: true,
        };

        let err = DumpExecutor::new(&driver).execute(&out, &options()).await.unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed(_)));
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[tokio::test]
    async fn test_zero_byte_dump_is_rejected() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("a.backup");
        let driver = ScriptedDriver {
            payload: Some(Vec::new()),
            reachable: true,
        };

        let err = DumpExecutor::new(&driver).execute(&out, &options()).await.unwrap_err();
        assert!(err.to_string().contains("zero bytes"));
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());
    }

    #[tokio::test]
    async fn test_probe_maps_to_source_unreachable() {
        let driver = ScriptedDriver {
            payload: None,
            reachable: false,
        };
        let err = DumpExecutor::new(&driver).probe().await.unwrap_err();
        assert!(matches!(err, BackupError::SourceUnreachable(_)));
    }
}
