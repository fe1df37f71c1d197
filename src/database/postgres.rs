use super::driver::{DatabaseDriver, DumpOptions};
use crate::backup::archive::bundle_directory;
use crate::config::SourceConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

pub struct PostgresDriver {
    config: SourceConfig,
    pg_dump: Option<PathBuf>,
}

impl PostgresDriver {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            config: config.clone(),
            pg_dump: None,
        }
    }

    /// Uses an explicit `pg_dump` binary instead of searching `PATH`.
    pub fn with_pg_dump(mut self, path: PathBuf) -> Self {
        self.pg_dump = Some(path);
        self
    }

    fn connect_options(&self) -> Result<PgConnectOptions> {
        let mut opts = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.username)
            .password(&self.config.password)
            .database(&self.config.database);
        if let Some(mode) = &self.config.sslmode {
            let mode = PgSslMode::from_str(mode)
                .map_err(|e| BackupError::ConfigInvalid(format!("source.sslmode: {}", e)))?;
            opts = opts.ssl_mode(mode);
        }
        Ok(opts.disable_statement_logging())
    }

    fn pg_dump_path(&self) -> Result<PathBuf> {
        match &self.pg_dump {
            Some(path) => Ok(path.clone()),
            None => which("pg_dump").map_err(|_| {
                BackupError::DumpFailed(
                    "pg_dump executable not found in PATH; install the PostgreSQL client tools"
                        .to_string(),
                )
            }),
        }
    }

    fn base_command(&self, pg_dump: &Path, options: &DumpOptions) -> Command {
        let mut cmd = Command::new(pg_dump);
        cmd.arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--username")
            .arg(&self.config.username)
            .arg("--dbname")
            .arg(&self.config.database)
            .arg("--no-password")
            .arg(format!("--compress={}", options.compression_level))
            .env("PGPASSWORD", &self.config.password)
            .kill_on_drop(true);
        if let Some(mode) = &self.config.sslmode {
            cmd.env("PGSSLMODE", mode);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<()> {
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::DumpFailed(format!("failed to execute pg_dump: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::DumpFailed(format!(
                "pg_dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn test_connection(&self) -> Result<()> {
        info!(
            "Testing PostgreSQL connection to {}:{}",
            self.config.host, self.config.port
        );
        let mut conn = self
            .connect_options()?
            .connect()
            .await
            .map_err(|e| BackupError::SourceUnreachable(e.to_string()))?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| BackupError::SourceUnreachable(e.to_string()))?;
        let _ = conn.close().await;
        info!("PostgreSQL connection successful");
        Ok(())
    }

    async fn dump(&self, output: &Path, options: &DumpOptions) -> Result<()> {
        let pg_dump = self.pg_dump_path()?;
        debug!("Using pg_dump at {}", pg_dump.display());

        if options.parallelism <= 1 {
            let mut cmd = self.base_command(&pg_dump, options);
            cmd.arg("--format=custom").arg("--file").arg(output);
            return self.run(cmd).await;
        }

        let staging = staging_dir(output);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        let mut cmd = self.base_command(&pg_dump, options);
        cmd.arg("--format=directory")
            .arg(format!("--jobs={}", options.parallelism))
            .arg("--file")
            .arg(&staging);

        let result = match self.run(cmd).await {
            Ok(()) => bundle_directory(&staging, output).map(|_| ()),
            Err(e) => Err(e),
        };
        if staging.exists() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        result
    }

    fn engine_name(&self) -> &'static str {
        "PostgreSQL"
    }
}

/// Scratch directory for multi-worker dumps, next to the final artifact.
pub fn staging_dir(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".d");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn source() -> SourceConfig {
        SourceConfig {
            database: "appdb".to_string(),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn test_staging_dir_sits_next_to_output() {
        let out = Path::new("/var/backups/backup_appdb_20260101_000000.backup.partial");
        assert_eq!(
            staging_dir(out),
            PathBuf::from("/var/backups/backup_appdb_20260101_000000.backup.partial.d")
        );
    }

    #[test]
    fn test_invalid_sslmode_is_config_error() {
        let mut config = source();
        config.sslmode = Some("sometimes".to_string());
        let driver = PostgresDriver::new(&config);
        assert!(matches!(
            driver.connect_options(),
            Err(BackupError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_pg_dump_binary_is_dump_failure() {
        let dir = tempdir().unwrap();
        let driver = PostgresDriver::new(&source()).with_pg_dump(dir.path().join("no-such-pg_dump"));
        let options = DumpOptions {
            compression_level: 6,
            parallelism: 1,
        };
        let err = driver
            .dump(&dir.path().join("out.backup"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed(_)));
        assert!(!dir.path().join("out.backup").exists());
    }
}
