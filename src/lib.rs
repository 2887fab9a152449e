//! Testlane -- self-hosted browser test execution engine.
//!
//! This crate provides the core library for admission-controlled test
//! execution: per-job sandbox provisioning, supervised runner processes,
//! result normalization, artifact storage with retention, and an SQLite
//! execution record store.

pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod report;
pub mod sandbox;
pub mod storage;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use artifact::cleanup::{run_cleanup_loop, ArtifactCleaner};
use artifact::ArtifactStore;
use config::EngineConfig;
use engine::ExecutionEngine;
use error::EngineError;
use storage::{ExecutionRepo, StatusPatch};

/// Start the testlane daemon: queue polling, execution engine, and the
/// artifact cleanup scheduler. Runs until SIGINT, then drains gracefully.
pub async fn serve(config: EngineConfig) -> Result<()> {
    // 1. Initialize storage
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let repo = ExecutionRepo::new(pool);

    // 2. Initialize artifact store and engine
    let artifacts = Arc::new(ArtifactStore::from_config(&config, repo.clone())?);
    tracing::info!(provider = artifacts.provider_name(), "Artifact store ready");
    let engine = ExecutionEngine::new(config.clone(), repo.clone(), artifacts.clone());

    // 3. Start artifact cleanup scheduler (background task)
    let cleanup_cancel = CancellationToken::new();
    let cleaner = ArtifactCleaner::new(
        artifacts,
        repo.clone(),
        config.artifacts.cleanup_batch_limit,
    );
    let schedule = config.artifacts.cleanup_schedule.clone();
    let cleanup_token = cleanup_cancel.clone();
    let cleanup_task = tokio::spawn(async move {
        if let Err(e) = run_cleanup_loop(cleaner, &schedule, cleanup_token).await {
            tracing::error!(error = %e, "artifact cleanup scheduler failed");
        }
    });

    // 4. Poll the queue until shutdown
    tracing::info!(
        max_concurrent = config.engine.max_concurrent,
        "testlane engine running"
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                admit_queued(&engine, &repo, config.engine.max_concurrent);
            }
        }
    }

    // 5. Drain and stop
    cleanup_cancel.cancel();
    engine.shutdown().await;
    let _ = cleanup_task.await;
    tracing::info!("testlane stopped");
    Ok(())
}

/// Pull queued executions into the engine up to the free capacity.
fn admit_queued(engine: &ExecutionEngine, repo: &ExecutionRepo, max_concurrent: usize) {
    let free = max_concurrent.saturating_sub(engine.running_count());
    if free == 0 {
        return;
    }
    let batch = match repo.next_queued(free) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "failed to read execution queue");
            return;
        }
    };
    for execution in batch {
        let id = execution.id;
        match engine.submit(execution) {
            Ok(_) => {}
            Err(EngineError::CapacityExceeded { .. }) | Err(EngineError::ServiceUnavailable) => {
                return;
            }
            Err(e @ EngineError::Validation(_)) => {
                // A malformed record would be re-read every poll; fail it so
                // the queue keeps moving.
                tracing::warn!(execution_id = %id, error = %e, "rejecting malformed queued execution");
                fail_queued(repo, id, &e.to_string());
            }
            Err(e) => {
                tracing::error!(execution_id = %id, error = %e, "failed to admit execution");
            }
        }
    }
}

/// Force a queued record to `failed` through the guarded transitions.
fn fail_queued(repo: &ExecutionRepo, id: uuid::Uuid, message: &str) {
    let claimed = repo
        .find_and_update(id, &StatusPatch::running())
        .unwrap_or(false);
    if claimed {
        let patch = StatusPatch::terminal(model::ExecutionStatus::Failed, Some(message.to_string()));
        if let Err(e) = repo.find_and_update(id, &patch) {
            tracing::error!(execution_id = %id, error = %e, "failed to mark execution failed");
        }
    }
}
