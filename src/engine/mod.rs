//! Execution engine -- admission-controlled worker pool.
//!
//! The engine admits queued executions up to a fixed concurrency limit and
//! runs each one on its own task through the processing pipeline. Admission
//! is the only place `queued -> running` happens; capacity, duplicate, and
//! shutdown checks all happen under one lock so the limit can never be
//! oversubscribed.

mod pipeline;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::Execution;
use crate::sandbox::Provisioner;
use crate::storage::{ExecutionRepo, StatusPatch};
use crate::supervisor::sampler::{self, UsageCell};
use crate::supervisor::Supervisor;

/// Tracking entry for one admitted job.
struct RunningJob {
    terminate_tx: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    usage: UsageCell,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) repo: ExecutionRepo,
    pub(crate) artifacts: Arc<ArtifactStore>,
    pub(crate) provisioner: Provisioner,
    pub(crate) supervisor: Supervisor,
    /// Never held across an await point.
    running: Mutex<HashMap<Uuid, RunningJob>>,
    /// Trips once at shutdown; admission refuses afterwards.
    pub(crate) lifecycle: CancellationToken,
}

impl EngineInner {
    fn remove_running(&self, id: Uuid) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&id);
        }
    }
}

/// Admission-controlled execution engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, repo: ExecutionRepo, artifacts: Arc<ArtifactStore>) -> Self {
        let provisioner = Provisioner::new(config.clone());
        let supervisor = Supervisor::new(config.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                repo,
                artifacts,
                provisioner,
                supervisor,
                running: Mutex::new(HashMap::new()),
                lifecycle: CancellationToken::new(),
            }),
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Admit a queued execution and start processing it.
    ///
    /// Rejects with [`EngineError::ServiceUnavailable`] during shutdown,
    /// [`EngineError::CapacityExceeded`] at the concurrency limit, and
    /// [`EngineError::Validation`] for malformed input, duplicates, or a
    /// record that is no longer `queued`.
    pub fn submit(&self, execution: Execution) -> Result<Uuid, EngineError> {
        validate(&execution)?;
        if self.inner.lifecycle.is_cancelled() {
            return Err(EngineError::ServiceUnavailable);
        }

        let id = execution.id;
        let max = self.inner.config.engine.max_concurrent;
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let usage = sampler::new_usage_cell();
        let cancel = self.inner.lifecycle.child_token();

        {
            let mut running = self
                .inner
                .running
                .lock()
                .map_err(|_| EngineError::Storage("running map poisoned".to_string()))?;
            if running.contains_key(&id) {
                return Err(EngineError::Validation(format!(
                    "execution {id} is already running"
                )));
            }
            if running.len() >= max {
                return Err(EngineError::CapacityExceeded {
                    running: running.len(),
                    max,
                });
            }
            running.insert(
                id,
                RunningJob {
                    terminate_tx: Some(terminate_tx),
                    cancel: cancel.clone(),
                    usage: usage.clone(),
                    task: None,
                },
            );
        }

        // Claim the record. Losing the guard means the execution was already
        // picked up or cancelled elsewhere; undo the reservation.
        let claimed = self
            .inner
            .repo
            .find_and_update(id, &StatusPatch::running())
            .map_err(|e| {
                self.inner.remove_running(id);
                EngineError::Storage(e.to_string())
            })?;
        if !claimed {
            self.inner.remove_running(id);
            return Err(EngineError::Validation(format!(
                "execution {id} is not in queued state"
            )));
        }

        info!(
            execution_id = %id,
            name = %execution.name,
            browser = execution.browser.as_str(),
            "execution admitted"
        );

        // Spawn and attach the task handle under one lock pass so a
        // concurrent shutdown either sees the handle or stops this job
        // before it starts. Shutdown cancels the lifecycle token before it
        // takes the lock, so re-checking it here closes the window.
        {
            let mut running = self
                .inner
                .running
                .lock()
                .map_err(|_| EngineError::Storage("running map poisoned".to_string()))?;
            if self.inner.lifecycle.is_cancelled() {
                running.remove(&id);
                drop(running);
                let patch = StatusPatch::terminal(
                    crate::model::ExecutionStatus::Cancelled,
                    Some("service shutdown".to_string()),
                );
                if let Err(e) = self.inner.repo.find_and_update(id, &patch) {
                    warn!(execution_id = %id, error = %e, "failed to cancel claimed execution");
                }
                return Err(EngineError::ServiceUnavailable);
            }
            let task = tokio::spawn(pipeline::process(
                self.inner.clone(),
                execution,
                usage,
                terminate_rx,
                cancel,
            ));
            if let Some(entry) = running.get_mut(&id) {
                entry.task = Some(task);
            }
        }
        Ok(id)
    }

    /// Request cancellation of one running execution. The pipeline writes
    /// the terminal state; returns `NotFound` when the job is not running.
    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let running = self
            .inner
            .running
            .lock()
            .map_err(|_| EngineError::Storage("running map poisoned".to_string()))?;
        match running.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("running execution {id}"))),
        }
    }

    /// Peak memory observed so far for a running execution.
    pub fn current_peak_memory(&self, id: Uuid) -> Option<u64> {
        let running = self.inner.running.lock().ok()?;
        let job = running.get(&id)?;
        let usage = job.usage.lock().ok()?;
        Some(usage.peak_memory_bytes)
    }

    /// Graceful shutdown: stop admitting, terminate every in-flight runner,
    /// and wait up to the configured grace for pipelines to finish their
    /// terminal writes. A pipeline that outlives the grace keeps draining in
    /// the background; its record is force-marked `cancelled` here, and the
    /// straggler's own terminal write then loses the guard and is a no-op.
    pub async fn shutdown(&self) {
        self.inner.lifecycle.cancel();

        let (ids, tasks): (Vec<Uuid>, Vec<JoinHandle<()>>) = {
            let mut running = match self.inner.running.lock() {
                Ok(r) => r,
                Err(_) => return,
            };
            let mut ids = Vec::new();
            let mut tasks = Vec::new();
            for (id, job) in running.iter_mut() {
                if let Some(tx) = job.terminate_tx.take() {
                    let _ = tx.send(());
                }
                job.cancel.cancel();
                if let Some(task) = job.task.take() {
                    ids.push(*id);
                    tasks.push(task);
                }
            }
            (ids, tasks)
        };

        if tasks.is_empty() {
            info!("engine shut down with no jobs in flight");
            return;
        }

        info!(in_flight = tasks.len(), "engine draining in-flight executions");
        let grace = Duration::from_secs(self.inner.config.engine.shutdown_grace_secs);
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                grace_secs = grace.as_secs(),
                "shutdown grace expired, forcing terminal state on stragglers"
            );
            for id in ids {
                // The guard makes this a no-op for pipelines that did finish.
                let patch = StatusPatch::terminal(
                    crate::model::ExecutionStatus::Cancelled,
                    Some("service shutdown".to_string()),
                );
                if let Err(e) = self.inner.repo.find_and_update(id, &patch) {
                    warn!(execution_id = %id, error = %e, "failed to force cancelled state");
                }
            }
        }
        info!("engine shut down");
    }
}

fn validate(execution: &Execution) -> Result<(), EngineError> {
    if execution.name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".to_string()));
    }
    if !execution.base_url.starts_with("http://") && !execution.base_url.starts_with("https://") {
        return Err(EngineError::Validation(format!(
            "base_url must be an http(s) URL: {}",
            execution.base_url
        )));
    }
    if execution.script.trim().is_empty() {
        return Err(EngineError::Validation(
            "script must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Browser, ExecutionStatus};

    fn engine_in(dir: &std::path::Path, max_concurrent: usize) -> (ExecutionEngine, ExecutionRepo) {
        let mut cfg = EngineConfig::default();
        cfg.engine.max_concurrent = max_concurrent;
        cfg.engine.sandbox_root = dir.join("sandboxes").to_str().unwrap().to_string();
        cfg.artifacts.base_path = dir.join("artifacts").to_str().unwrap().to_string();
        cfg.runner.command = "sh".to_string();
        cfg.runner.args = vec!["-c".to_string(), "sleep 5".to_string()];
        cfg.runner.ensure_install = false;

        let pool = crate::storage::open_pool(dir.join("t.db").to_str().unwrap()).unwrap();
        let repo = ExecutionRepo::new(pool);
        let artifacts =
            Arc::new(ArtifactStore::from_config(&cfg, repo.clone()).unwrap());
        (
            ExecutionEngine::new(cfg, repo.clone(), artifacts),
            repo,
        )
    }

    fn queued(repo: &ExecutionRepo) -> Execution {
        let e = Execution::new("t", "https://example.test", Browser::Chromium, "//", "ci");
        repo.insert(&e).unwrap();
        e
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _repo) = engine_in(dir.path(), 1);

        let bad_url = Execution::new("t", "ftp://example.test", Browser::Chromium, "//", "ci");
        assert!(matches!(
            engine.submit(bad_url),
            Err(EngineError::Validation(_))
        ));

        let empty_script = Execution::new("t", "https://example.test", Browser::Chromium, "  ", "ci");
        assert!(matches!(
            engine.submit(empty_script),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_rejection_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repo) = engine_in(dir.path(), 1);

        engine.submit(queued(&repo)).unwrap();
        let err = engine.submit(queued(&repo)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { running: 1, max: 1 }
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_requires_queued_record() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repo) = engine_in(dir.path(), 5);

        // A record that already ran cannot be admitted again.
        let e = queued(&repo);
        repo.find_and_update(e.id, &StatusPatch::running()).unwrap();
        repo.find_and_update(
            e.id,
            &StatusPatch::terminal(ExecutionStatus::Completed, None),
        )
        .unwrap();

        assert!(matches!(
            engine.submit(e),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, repo) = engine_in(dir.path(), 5);
        engine.shutdown().await;
        assert!(matches!(
            engine.submit(queued(&repo)),
            Err(EngineError::ServiceUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _repo) = engine_in(dir.path(), 1);
        assert!(matches!(
            engine.cancel(Uuid::new_v4()),
            Err(EngineError::NotFound(_))
        ));
    }
}
