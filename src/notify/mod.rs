mod webhook;

pub use webhook::{MetricsNotifier, WebhookNotifier};

use crate::config::NotifyConfig;
use crate::error::Result;
use crate::run::{BackupRun, RunStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Completed,
    Failed,
}

/// Payload sent once per terminal run state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub kind: EventKind,
    pub run_id: String,
    pub status: RunStatus,
    pub database: String,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub destinations_succeeded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunEvent {
    pub fn from_run(run: &BackupRun) -> Self {
        let kind = if run.status == RunStatus::Failed {
            EventKind::Failed
        } else {
            EventKind::Completed
        };
        let duration_seconds = run
            .finished_at
            .map(|end| (end - run.started_at).num_milliseconds() as f64 / 1000.0)
            .or(run.duration_seconds)
            .unwrap_or(0.0);
        Self {
            kind,
            run_id: run.id.clone(),
            status: run.status,
            database: run.database_name.clone(),
            duration_seconds,
            size_bytes: run.artifact_size_bytes.unwrap_or(0),
            destinations_succeeded: run.uploaded_destinations.iter().cloned().collect(),
            error: run.error.clone(),
        }
    }

    pub fn message(&self) -> String {
        match self.kind {
            EventKind::Completed => format!(
                "Backup of `{}` completed (run {}): {:.2} MB in {:.1}s, stored on {}",
                self.database,
                self.run_id,
                self.size_bytes as f64 / 1024.0 / 1024.0,
                self.duration_seconds,
                if self.destinations_succeeded.is_empty() {
                    "local disk only".to_string()
                } else {
                    self.destinations_succeeded.join(", ")
                }
            ),
            EventKind::Failed => format!(
                "Backup of `{}` FAILED (run {}) after {:.1}s: {}",
                self.database,
                self.run_id,
                self.duration_seconds,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &RunEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Fans one event out to every configured sink. Sink failures are logged
/// and dropped; at most one event is ever sent per set.
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notifier>>,
    sent: AtomicBool,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            notifiers,
            sent: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if let Some(url) = &config.metrics_url {
            notifiers.push(Box::new(MetricsNotifier::new(url)));
        }
        if let Some(url) = &config.webhook_url {
            notifiers.push(Box::new(WebhookNotifier::new(url)));
        }
        Self::new(notifiers)
    }

    /// Returns false when an event was already sent.
    pub async fn notify_terminal(&self, event: &RunEvent) -> bool {
        if self.sent.swap(true, Ordering::SeqCst) {
            debug!("Terminal notification already sent; skipping");
            return false;
        }
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                warn!("{} notification failed: {}", notifier.name(), e);
            }
        }
        true
    }
}
