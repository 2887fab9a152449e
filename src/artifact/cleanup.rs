//! Scheduled artifact retention cleanup.
//!
//! Two sweeps run on a cron schedule: expired artifacts (past their
//! retention window) and orphans (file rows whose execution record no longer
//! exists). Individual deletion failures are logged and skipped so a broken
//! object never wedges the sweep; both sweeps are idempotent.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::storage::ExecutionRepo;

use super::ArtifactStore;

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_deleted: usize,
    pub orphans_deleted: usize,
    pub failures: usize,
}

/// Deletes expired and orphaned artifacts in bounded batches.
pub struct ArtifactCleaner {
    store: Arc<ArtifactStore>,
    repo: ExecutionRepo,
    batch_limit: usize,
}

impl ArtifactCleaner {
    pub fn new(store: Arc<ArtifactStore>, repo: ExecutionRepo, batch_limit: usize) -> Self {
        Self {
            store,
            repo,
            batch_limit,
        }
    }

    /// Run both sweeps once.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.sweep_expired(now, &mut report).await;
        self.sweep_orphans(&mut report).await;
        if report.expired_deleted + report.orphans_deleted + report.failures > 0 {
            info!(
                expired = report.expired_deleted,
                orphans = report.orphans_deleted,
                failures = report.failures,
                "artifact cleanup pass finished"
            );
        }
        report
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, report: &mut CleanupReport) {
        let batch = match self.repo.expired_files(now, self.batch_limit) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to query expired artifacts");
                report.failures += 1;
                return;
            }
        };
        for file in batch {
            match self.store.delete_stored(&file).await {
                Ok(()) => report.expired_deleted += 1,
                Err(e) => {
                    warn!(id = %file.id, key = %file.storage_key, error = %e,
                        "failed to delete expired artifact, will retry next pass");
                    report.failures += 1;
                }
            }
        }
    }

    async fn sweep_orphans(&self, report: &mut CleanupReport) {
        let batch = match self.repo.orphan_files(self.batch_limit) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to query orphaned artifacts");
                report.failures += 1;
                return;
            }
        };
        for file in batch {
            match self.store.delete_stored(&file).await {
                Ok(()) => report.orphans_deleted += 1,
                Err(e) => {
                    warn!(id = %file.id, key = %file.storage_key, error = %e,
                        "failed to delete orphaned artifact, will retry next pass");
                    report.failures += 1;
                }
            }
        }
    }
}

/// Cron-driven cleanup loop. Checks the schedule every 10 seconds and runs a
/// pass when the next fire time is reached; exits when `cancel` trips.
pub async fn run_cleanup_loop(
    cleaner: ArtifactCleaner,
    schedule: &str,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let schedule = Schedule::from_str(schedule)
        .map_err(|e| EngineError::Validation(format!("invalid cleanup schedule: {e}")))?;
    let mut next_fire = schedule.upcoming(Utc).next();
    info!(next = ?next_fire, "artifact cleanup scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("artifact cleanup scheduler stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
        }

        let now = Utc::now();
        if let Some(fire) = next_fire {
            if now >= fire {
                cleaner.run_once(now).await;
                next_fire = schedule.upcoming(Utc).next();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactMeta;
    use crate::config::EngineConfig;
    use crate::model::{Browser, Execution, FileType};
    use uuid::Uuid;

    async fn setup(dir: &std::path::Path) -> (Arc<ArtifactStore>, ExecutionRepo, Uuid) {
        let pool = crate::storage::open_pool(dir.join("t.db").to_str().unwrap()).unwrap();
        let repo = ExecutionRepo::new(pool);
        let execution =
            Execution::new("t", "https://example.test", Browser::Chromium, "//", "ci");
        repo.insert(&execution).unwrap();

        let mut cfg = EngineConfig::default();
        cfg.artifacts.base_path = dir.join("artifacts").to_str().unwrap().to_string();
        let store = Arc::new(ArtifactStore::from_config(&cfg, repo.clone()).unwrap());
        (store, repo, execution.id)
    }

    fn meta(execution_id: Uuid, name: &str, file_type: FileType) -> ArtifactMeta {
        ArtifactMeta {
            execution_id,
            detail_id: None,
            file_name: name.to_string(),
            file_type,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn test_expired_sweep_deletes_only_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, eid) = setup(dir.path()).await;

        let old = store
            .store(b"v", meta(eid, "run.webm", FileType::Video))
            .await
            .unwrap();
        let fresh = store
            .store(b"s", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();

        let cleaner = ArtifactCleaner::new(store, repo.clone(), 100);
        // Video retention is 7 days, screenshot expiry is identical; sweep
        // at +8d to catch the video, then check nothing remains either.
        let report = cleaner.run_once(Utc::now()).await;
        assert_eq!(report.expired_deleted, 0);

        let report = cleaner
            .run_once(Utc::now() + chrono::Duration::days(8))
            .await;
        assert_eq!(report.expired_deleted, 2);
        assert_eq!(report.failures, 0);
        assert!(repo.find_file(old.id).unwrap().is_none());
        assert!(repo.find_file(fresh.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_sweep_deletes_files_without_execution() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, eid) = setup(dir.path()).await;

        let kept = store
            .store(b"s", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();
        // A file row pointing at an execution that was never recorded.
        let orphan = store
            .store(b"o", meta(Uuid::new_v4(), "lost.png", FileType::Screenshot))
            .await
            .unwrap();

        let cleaner = ArtifactCleaner::new(store, repo.clone(), 100);
        let report = cleaner.run_once(Utc::now()).await;
        assert_eq!(report.orphans_deleted, 1);
        assert!(repo.find_file(orphan.id).unwrap().is_none());
        assert!(repo.find_file(kept.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, _eid) = setup(dir.path()).await;

        let orphan = store
            .store(b"o", meta(Uuid::new_v4(), "lost.log", FileType::Log))
            .await
            .unwrap();

        let cleaner = ArtifactCleaner::new(store, repo.clone(), 100);
        let first = cleaner.run_once(Utc::now()).await;
        assert_eq!(first.orphans_deleted, 1);
        let second = cleaner.run_once(Utc::now()).await;
        assert_eq!(second, CleanupReport::default());
        assert!(repo.find_file(orphan.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, _eid) = setup(dir.path()).await;

        for i in 0..5 {
            store
                .store(
                    b"o",
                    meta(Uuid::new_v4(), &format!("lost-{i}.log"), FileType::Log),
                )
                .await
                .unwrap();
        }

        let cleaner = ArtifactCleaner::new(store, repo, 2);
        let report = cleaner.run_once(Utc::now()).await;
        assert_eq!(report.orphans_deleted, 2);
    }

    #[tokio::test]
    async fn test_loop_rejects_bad_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, _eid) = setup(dir.path()).await;
        let cleaner = ArtifactCleaner::new(store, repo, 100);
        let err = run_cleanup_loop(cleaner, "not a cron expr", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
