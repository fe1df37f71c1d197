use crate::error::{BackupError, Result};
use crate::run::embedded_timestamp;
use crate::storage::{ObjectStore, StoredObject};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Zero disables pruning.
    pub max_age_days: u32,
    /// Only names starting with this are considered; the run timestamp
    /// follows it directly.
    pub name_prefix: String,
}

/// Deletes objects in `store` older than the policy allows. Names starting
/// with `protected` belong to the run in progress and are never deleted.
/// Individual delete failures are logged and skipped; a failed listing
/// fails the whole scope.
pub async fn prune(
    store: &dyn ObjectStore,
    policy: &RetentionPolicy,
    protected: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    if policy.max_age_days == 0 {
        debug!("Retention disabled for {}", store.id());
        return Ok(0);
    }
    let Some(cutoff) = Duration::try_days(i64::from(policy.max_age_days))
        .and_then(|age| now.checked_sub_signed(age))
    else {
        debug!(
            "Retention of {} days reaches past the earliest date; nothing to prune",
            policy.max_age_days
        );
        return Ok(0);
    };

    let objects = store
        .list(&policy.name_prefix)
        .await
        .map_err(|e| BackupError::Prune(format!("listing {}: {}", store.id(), e)))?;

    let mut deleted = 0;
    for object in objects {
        if !protected.is_empty() && object.name.starts_with(protected) {
            continue;
        }
        let Some(created) = created_at(&object, &policy.name_prefix) else {
            debug!("Skipping {}: no usable timestamp", object.name);
            continue;
        };
        if created >= cutoff {
            continue;
        }

        match store.delete(&object.name).await {
            Ok(()) => {
                debug!("Pruned {} from {}", object.name, store.id());
                deleted += 1;
            }
            Err(e) => warn!("Could not prune {} from {}: {}", object.name, store.id(), e),
        }
    }

    if deleted > 0 {
        info!(
            "Pruned {} object(s) older than {} days from {}",
            deleted,
            policy.max_age_days,
            store.id()
        );
    }
    Ok(deleted)
}

/// Age reference for an object matched by `stem`. A name whose stem is
/// followed by another `_` segment instead of a run timestamp belongs to a
/// different database sharing the stem (`appdb` vs `appdb_staging`) and is
/// never aged.
fn created_at(object: &StoredObject, stem: &str) -> Option<DateTime<Utc>> {
    if let Some(stamp) = embedded_timestamp(&object.name, stem) {
        return Some(stamp);
    }
    let rest = object.name.strip_prefix(stem)?;
    let base = rest.split('.').next().unwrap_or(rest);
    if base.contains('_') {
        return None;
    }
    object.last_modified
}
