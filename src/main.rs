mod backup;
mod config;
mod database;
mod encrypt;
mod error;
mod log;
mod notify;
mod retention;
mod run;
mod storage;
mod upload;

use backup::{BackupOrchestrator, CleanupTracker, Components, RunLock};
use error::BackupError;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

struct Args {
    config_path: PathBuf,
    check_only: bool,
    init: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_path: config::config_path(),
        check_only: false,
        init: false,
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| format!("{} needs a path", arg))?;
                args.config_path = PathBuf::from(path);
            }
            "--check-config" => args.check_only = true,
            "--init" => args.init = true,
            "-h" | "--help" => {
                println!(
                    "Usage: db-backup-pipeline [--config <path>] [--check-config | --init]\n\n\
                     Runs one backup of the configured database. --init writes a default\n\
                     config file if none exists. Default config: {}",
                    config::config_path().display()
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    log::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_with(&BackupError::ConfigInvalid(e));
        }
    };

    if args.init {
        if args.config_path.exists() {
            warn!("{} already exists; leaving it unchanged", args.config_path.display());
            return ExitCode::SUCCESS;
        }
        return match config::save_to(&config::AppConfig::default(), &args.config_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                exit_with(&e)
            }
        };
    }

    let app_config = match config::load_from(&args.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            return exit_with(&e);
        }
    };

    if args.check_only {
        return match app_config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                exit_with(&e)
            }
        };
    }

    let lock = match RunLock::acquire(
        &app_config.backup.local_backup_dir,
        &app_config.source.database,
    ) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return exit_with(&e);
        }
    };

    // First signal fails the run through the orchestrator; a second one
    // exits on the spot.
    let tracker = CleanupTracker::new();
    let shutdown = Arc::new(Notify::new());
    let signal_count = Arc::new(AtomicUsize::new(0));
    let signal_shutdown = shutdown.clone();
    let signal_tracker = tracker.clone();
    let lock_path = lock.path().to_path_buf();
    if let Err(e) = ctrlc::set_handler(move || {
        if signal_count.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("Termination signal received; stopping the run. Signal again to force exit");
            signal_shutdown.notify_one();
        } else {
            warn!("Forcing exit; removing partial files");
            signal_tracker.cleanup();
            let _ = std::fs::remove_file(&lock_path);
            std::process::exit(BackupError::Interrupted.exit_code());
        }
    }) {
        warn!("Could not install signal handler: {}", e);
    }

    let components = Components::from_config(&app_config);
    let outcome = BackupOrchestrator::new(app_config, components, tracker)
        .run_until(async move { shutdown.notified().await })
        .await;
    drop(lock);

    if outcome.is_success() {
        info!("Run {} finished", outcome.run.id);
        ExitCode::SUCCESS
    } else {
        error!(
            "Run {} ended in {} with exit code {}",
            outcome.run.id,
            outcome.stage,
            outcome.exit_code()
        );
        ExitCode::from(outcome.exit_code().clamp(1, 255) as u8)
    }
}

fn exit_with(err: &BackupError) -> ExitCode {
    ExitCode::from(err.exit_code().clamp(1, 255) as u8)
}
