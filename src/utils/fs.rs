//! Atomic state-file writes.
//!
//! Every state mutation in the crate follows the same discipline:
//! serialize, write a temp file in the target directory, rename over the
//! target. Rename retries on transient failure; on exhaustion a prior
//! backup is restored and a [`FleetError::StateWrite`] surfaces instead of
//! a silently dropped write.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};

const RENAME_RETRIES: u32 = 3;
const RENAME_BACKOFF: Duration = Duration::from_millis(25);

/// Serialize `value` as pretty JSON and atomically replace `target`.
pub async fn atomic_write_json<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(target, &bytes).await
}

/// Atomically replace `target` with `bytes`.
pub async fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = target.parent().ok_or_else(|| {
        FleetError::state_write(target.display().to_string(), "target has no parent directory")
    })?;
    tokio::fs::create_dir_all(dir).await?;

    // Temp file lives in the target directory so the rename stays on one
    // filesystem and is atomic.
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, bytes).await?;

    // Keep a backup of the previous content for restore-on-failure.
    let backup = dir.join(format!(
        ".{}.bak",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    let had_previous = tokio::fs::copy(target, &backup).await.is_ok();

    let mut last_err: Option<std::io::Error> = None;
    for attempt in 1..=RENAME_RETRIES {
        match tokio::fs::rename(&tmp, target).await {
            Ok(()) => {
                if had_previous {
                    let _ = tokio::fs::remove_file(&backup).await;
                }
                debug!(target_file = %target.display(), "state file written");
                return Ok(());
            }
            Err(e) => {
                warn!(
                    target_file = %target.display(),
                    attempt,
                    error = %e,
                    "rename failed, retrying"
                );
                last_err = Some(e);
                tokio::time::sleep(RENAME_BACKOFF * attempt).await;
            }
        }
    }

    // Retries exhausted: restore the backup so readers keep seeing a
    // consistent previous state, then surface the failure.
    let _ = tokio::fs::remove_file(&tmp).await;
    if had_previous {
        if let Err(e) = tokio::fs::rename(&backup, target).await {
            warn!(target_file = %target.display(), error = %e, "backup restore failed");
        }
    }

    Err(FleetError::StateWrite {
        path: target.display().to_string(),
        message: format!("rename failed after {} attempts", RENAME_RETRIES),
        source: last_err.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}
