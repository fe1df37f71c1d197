mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PASSWORD_ENV: &str = "DB_BACKUP_PASSWORD";

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".db_backup_pipeline"))
        .unwrap_or_else(|| PathBuf::from(".db_backup_pipeline"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(with_env_overrides(AppConfig::default()));
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(with_env_overrides(config))
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating config directory: {:?}", parent);
            fs::create_dir_all(parent)?;
        }
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    info!("Configuration saved to {:?}", path);
    Ok(())
}

fn with_env_overrides(mut config: AppConfig) -> AppConfig {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            debug!("Using source password from {}", PASSWORD_ENV);
            config.source.password = password;
        }
    }
    config
}

impl AppConfig {
    /// Checks every field the pipeline relies on. Called once when a run starts.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.source.host.trim().is_empty() {
            problems.push("source.host is required".to_string());
        }
        if self.source.port == 0 {
            problems.push("source.port must be non-zero".to_string());
        }
        if self.source.database.trim().is_empty() {
            problems.push("source.database is required".to_string());
        }
        if self.source.username.trim().is_empty() {
            problems.push("source.username is required".to_string());
        }
        if self.backup.local_backup_dir.as_os_str().is_empty() {
            problems.push("backup.local_backup_dir is required".to_string());
        }
        if self.backup.name_prefix.trim().is_empty()
            || self.backup.name_prefix.contains(['/', '\\'])
        {
            problems.push("backup.name_prefix must be a non-empty file name fragment".to_string());
        }
        if self.backup.compression_level > 9 {
            problems.push(format!(
                "backup.compression_level must be 0-9, got {}",
                self.backup.compression_level
            ));
        }
        if self.backup.parallel_jobs == 0 {
            problems.push("backup.parallel_jobs must be at least 1".to_string());
        }
        if self.upload.max_attempts == 0 {
            problems.push("upload.max_attempts must be at least 1".to_string());
        }
        for (i, dest) in self.destinations.iter().enumerate() {
            if dest.bucket.trim().is_empty() {
                problems.push(format!("destinations[{}].bucket is required", i));
            }
        }
        for (name, url) in [
            ("notify.metrics_url", &self.notify.metrics_url),
            ("notify.webhook_url", &self.notify.webhook_url),
        ] {
            if let Some(url) = url {
                if reqwest::Url::parse(url).is_err() {
                    problems.push(format!("{} is not a valid URL", name));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BackupError::ConfigInvalid(problems.join("; ")))
        }
    }
}
