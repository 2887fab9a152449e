//! Per-job processing pipeline.
//!
//! Runs after admission, on the job's own task: provision the sandbox, run
//! the supervised runner, normalize the result, persist details, metrics and
//! artifacts, and write the guarded terminal status. The tracking entry is
//! removed and the sandbox destroyed on every path out.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactMeta;
use crate::error::EngineError;
use crate::model::{Execution, ExecutionStatus};
use crate::report::{self, Normalized};
use crate::storage::StatusPatch;
use crate::supervisor::sampler::{ResourceUsage, UsageCell};
use crate::supervisor::RunOutcome;

use super::EngineInner;

pub(super) async fn process(
    inner: Arc<EngineInner>,
    execution: Execution,
    usage: UsageCell,
    terminate_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    let id = execution.id;
    run(&inner, &execution, &usage, terminate_rx, cancel).await;
    inner.remove_running(id);
}

async fn run(
    inner: &EngineInner,
    execution: &Execution,
    usage: &UsageCell,
    terminate_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    let id = execution.id;

    let sandbox = match inner.provisioner.prepare(execution).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            // The runner never started; there is nothing to normalize.
            error!(execution_id = %id, error = %e, "sandbox provisioning failed");
            write_terminal(inner, id, ExecutionStatus::Failed, Some(e.to_string()));
            return;
        }
    };

    let outcome = match inner
        .supervisor
        .run(execution, &sandbox, usage.clone(), terminate_rx, cancel)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(execution_id = %id, error = %e, "runner could not be started");
            write_terminal(inner, id, ExecutionStatus::Failed, Some(e.to_string()));
            sandbox.destroy();
            return;
        }
    };

    // Timed-out and cancelled runs still flow through normalization so any
    // partial report and captured artifacts are persisted.
    let (raw, terminal) = match &outcome {
        RunOutcome::Exited(raw) => (raw, None),
        RunOutcome::TimedOut { limit, raw } => (
            raw,
            Some((
                ExecutionStatus::Failed,
                EngineError::Timeout { limit: *limit }.to_string(),
            )),
        ),
        RunOutcome::Cancelled { raw } => {
            let reason = if inner.lifecycle.is_cancelled() {
                "service shutdown"
            } else {
                "cancelled by request"
            };
            (raw, Some((ExecutionStatus::Cancelled, reason.to_string())))
        }
    };

    let snapshot: ResourceUsage = usage.lock().map(|u| u.clone()).unwrap_or_default();
    let normalized = report::normalize(id, raw, &sandbox, &snapshot);
    let stored = persist(inner, id, &normalized).await;

    match terminal {
        Some((status, message)) => {
            write_terminal(inner, id, status, Some(message));
        }
        None => {
            info!(
                execution_id = %id,
                status = %normalized.terminal_status,
                tests = normalized.metrics.total_tests,
                failed = normalized.metrics.total_failed,
                artifacts = stored,
                "execution finished"
            );
            write_terminal(inner, id, normalized.terminal_status, None);
        }
    }

    sandbox.destroy();
}

/// Persist details, artifacts, and metrics. Individual artifact failures are
/// logged and skipped; results must survive even when uploads do not.
/// Returns the number of artifacts actually stored.
async fn persist(inner: &EngineInner, id: Uuid, normalized: &Normalized) -> u32 {
    let detail_ids = match inner.repo.insert_details(&normalized.details) {
        Ok(ids) => ids,
        Err(e) => {
            error!(execution_id = %id, error = %e, "failed to persist test details");
            Vec::new()
        }
    };

    let mut stored = 0u32;
    for candidate in &normalized.candidates {
        let file_name = candidate
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact")
            .to_string();
        let meta = ArtifactMeta {
            execution_id: id,
            detail_id: candidate
                .detail_index
                .and_then(|i| detail_ids.get(i).copied()),
            file_name,
            file_type: candidate.file_type,
            mime_type: None,
        };
        match inner.artifacts.store_path(&candidate.path, meta).await {
            Ok(_) => stored += 1,
            Err(e) => {
                warn!(
                    execution_id = %id,
                    path = %candidate.path.display(),
                    error = %e,
                    "failed to store artifact, skipping"
                );
            }
        }
    }

    let mut metrics = normalized.metrics.clone();
    metrics.artifact_count = stored;
    if let Err(e) = inner.repo.insert_metrics(&metrics) {
        error!(execution_id = %id, error = %e, "failed to persist execution metrics");
    }
    stored
}

/// Guarded terminal write. Losing the guard means another path already
/// finished this execution; that is expected during shutdown races.
fn write_terminal(inner: &EngineInner, id: Uuid, status: ExecutionStatus, message: Option<String>) {
    match inner
        .repo
        .find_and_update(id, &StatusPatch::terminal(status, message))
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(execution_id = %id, status = %status, "terminal write was a no-op, already terminal");
        }
        Err(e) => {
            error!(execution_id = %id, error = %e, "failed to write terminal status");
        }
    }
}
