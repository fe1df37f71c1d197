pub mod archive;
pub mod cleanup;
mod orchestrator;

pub use cleanup::{CleanupTracker, RunLock};
pub use orchestrator::{BackupOrchestrator, Components, RunOutcome, Stage};
