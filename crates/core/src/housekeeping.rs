//! Periodic removal of stale exports from the output directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HousekeepingConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub kept: usize,
    pub failed: usize,
}

/// Deletes regular files in `dir` whose mtime is older than `now - retention`.
///
/// Creates `dir` when missing. Subdirectories are never touched. A file that
/// cannot be inspected or removed is counted in `failed` and skipped.
pub fn sweep_once(dir: &Path, retention: Duration, now: SystemTime) -> Result<SweepReport> {
    sweep_once_with(dir, retention, now, |path| fs::remove_file(path))
}

/// [`sweep_once`] with a caller-supplied delete operation.
pub fn sweep_once_with<R>(
    dir: &Path,
    retention: Duration,
    now: SystemTime,
    mut remove: R,
) -> Result<SweepReport>
where
    R: FnMut(&Path) -> io::Result<()>,
{
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;

    let mut report = SweepReport::default();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Failed to read directory entry");
                report.failed += 1;
                continue;
            }
        };
        let path = entry.path();

        let modified = match entry.metadata().and_then(|meta| {
            if meta.is_file() {
                meta.modified().map(Some)
            } else {
                Ok(None)
            }
        }) {
            Ok(Some(modified)) => modified,
            Ok(None) => continue,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to stat output file");
                report.failed += 1;
                continue;
            }
        };

        // mtime in the future counts as fresh
        let expired = now
            .duration_since(modified)
            .is_ok_and(|age| age > retention);
        if !expired {
            report.kept += 1;
            continue;
        }

        match remove(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted expired output");
                report.deleted.push(path);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to delete expired output");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

pub struct HousekeepingHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HousekeepingHandle {
    /// Stops the loop and waits for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "Housekeeping task ended abnormally");
        }
    }
}

/// Sweeps `dir` every `config.interval()` until `cancel` fires.
///
/// The first sweep runs one full interval after start.
pub fn spawn_housekeeping(
    config: &HousekeepingConfig,
    dir: PathBuf,
    cancel: CancellationToken,
) -> HousekeepingHandle {
    let period = config.interval().max(Duration::from_millis(1));
    let retention = config.retention();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            dir = %dir.display(),
            interval_secs = period.as_secs(),
            retention_secs = retention.as_secs(),
            "Housekeeping started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let sweep_dir = dir.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        sweep_once(&sweep_dir, retention, SystemTime::now())
                    })
                    .await;
                    match result {
                        Ok(Ok(report)) => {
                            if report.deleted.is_empty() && report.failed == 0 {
                                debug!(kept = report.kept, "Housekeeping sweep found nothing to delete");
                            } else {
                                info!(
                                    deleted = report.deleted.len(),
                                    kept = report.kept,
                                    failed = report.failed,
                                    "Housekeeping sweep finished"
                                );
                            }
                        }
                        Ok(Err(err)) => warn!(error = %format!("{err:#}"), "Housekeeping sweep failed"),
                        Err(err) => warn!(error = %err, "Housekeeping sweep panicked"),
                    }
                }
            }
        }

        info!("Housekeeping stopped");
    });

    HousekeepingHandle { cancel, task }
}
