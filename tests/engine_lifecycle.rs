//! End-to-end engine tests using a shell stand-in for the browser runner.
//!
//! The runner command is swapped for `sh -c` so each test controls exit
//! codes, report files, and sandbox output without a browser toolchain.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use testlane::artifact::ArtifactStore;
use testlane::config::EngineConfig;
use testlane::engine::ExecutionEngine;
use testlane::error::EngineError;
use testlane::model::{Browser, Execution, ExecutionStatus, FileType};
use testlane::storage::ExecutionRepo;

fn engine_with_runner(
    dir: &Path,
    script: &str,
    max_concurrent: usize,
    timeout_secs: u64,
) -> (ExecutionEngine, ExecutionRepo) {
    let mut cfg = EngineConfig::default();
    cfg.engine.max_concurrent = max_concurrent;
    cfg.engine.default_timeout_secs = timeout_secs;
    cfg.engine.kill_grace_secs = 2;
    cfg.engine.shutdown_grace_secs = 5;
    cfg.engine.sandbox_root = dir.join("sandboxes").to_str().unwrap().to_string();
    cfg.artifacts.base_path = dir.join("artifacts").to_str().unwrap().to_string();
    cfg.storage.db_path = dir.join("testlane.db").to_str().unwrap().to_string();
    cfg.runner.command = "sh".to_string();
    cfg.runner.args = vec!["-c".to_string(), script.to_string()];
    cfg.runner.ensure_install = false;

    let pool = testlane::storage::open_pool(&cfg.storage.db_path).unwrap();
    let repo = ExecutionRepo::new(pool);
    let artifacts = Arc::new(ArtifactStore::from_config(&cfg, repo.clone()).unwrap());
    (ExecutionEngine::new(cfg, repo.clone(), artifacts), repo)
}

fn submit_one(engine: &ExecutionEngine, repo: &ExecutionRepo) -> uuid::Uuid {
    let e = Execution::new(
        "lifecycle",
        "https://example.test",
        Browser::Chromium,
        "test('t', async () => {});",
        "ci",
    );
    repo.insert(&e).unwrap();
    engine.submit(e).unwrap()
}

async fn wait_terminal(repo: &ExecutionRepo, id: uuid::Uuid) -> Execution {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(e) = repo.find(id).unwrap() {
            if e.status.is_terminal() {
                return e;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {id} never reached a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_passing_run_completes_with_results() {
    let dir = tempfile::tempdir().unwrap();
    let report = r#"{"suites":[{"title":"auth","specs":[{"title":"login","tests":[{"results":[{"status":"passed","duration":42}]}]}]}]}"#;
    let script = format!("printf '{report}' > output/report.json");
    let (engine, repo) = engine_with_runner(dir.path(), &script, 2, 30);

    let id = submit_one(&engine, &repo);
    let finished = wait_terminal(&repo, id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.error_message.is_none());
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());

    let details = repo.details(id).unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].title, "auth > login");
    assert_eq!(details[0].duration_ms, 42);

    let metrics = repo.metrics(id).unwrap().unwrap();
    assert_eq!(metrics.total_tests, 1);
    assert_eq!(metrics.total_passed, 1);
}

#[tokio::test]
async fn test_nonzero_exit_without_report_is_synthetic_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, repo) =
        engine_with_runner(dir.path(), "echo 'browser crashed' >&2; exit 3", 2, 30);

    let id = submit_one(&engine, &repo);
    let finished = wait_terminal(&repo, id).await;
    assert_eq!(finished.status, ExecutionStatus::Failed);

    let details = repo.details(id).unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].title, "test run");
    assert_eq!(details[0].error_message.as_deref(), Some("browser crashed"));

    let metrics = repo.metrics(id).unwrap().unwrap();
    assert_eq!(metrics.total_failed, 1);
}

#[tokio::test]
async fn test_timeout_fails_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, repo) = engine_with_runner(dir.path(), "sleep 30", 2, 1);

    let id = submit_one(&engine, &repo);
    let finished = wait_terminal(&repo, id).await;
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert!(finished
        .error_message
        .unwrap()
        .contains("timed out after 1s"));
}

#[tokio::test]
async fn test_capacity_frees_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, repo) = engine_with_runner(dir.path(), "sleep 1", 1, 30);

    let first = submit_one(&engine, &repo);

    let blocked = Execution::new(
        "blocked",
        "https://example.test",
        Browser::Chromium,
        "//",
        "ci",
    );
    repo.insert(&blocked).unwrap();
    assert!(matches!(
        engine.submit(blocked.clone()),
        Err(EngineError::CapacityExceeded { running: 1, max: 1 })
    ));

    wait_terminal(&repo, first).await;
    // The slot is released once the pipeline finishes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.running_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let second = engine.submit(blocked).unwrap();
    wait_terminal(&repo, second).await;
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, repo) = engine_with_runner(dir.path(), "sleep 30", 2, 60);

    let a = submit_one(&engine, &repo);
    let b = submit_one(&engine, &repo);
    tokio::time::sleep(Duration::from_millis(300)).await;

    engine.shutdown().await;

    for id in [a, b] {
        let e = repo.find(id).unwrap().unwrap();
        assert_eq!(e.status, ExecutionStatus::Cancelled, "{id}");
        assert_eq!(e.error_message.as_deref(), Some("service shutdown"));
    }
    assert!(matches!(
        engine.submit(Execution::new(
            "late",
            "https://example.test",
            Browser::Chromium,
            "//",
            "ci"
        )),
        Err(EngineError::ServiceUnavailable)
    ));
}

#[tokio::test]
async fn test_shutdown_immediately_after_submit_waits_for_terminal_write() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, repo) = engine_with_runner(dir.path(), "sleep 30", 2, 60);

    // No delay between submit and shutdown: the drain must still collect
    // the just-spawned pipeline and wait for its terminal write.
    let id = submit_one(&engine, &repo);
    engine.shutdown().await;

    let e = repo.find(id).unwrap().unwrap();
    assert!(e.status.is_terminal(), "status was {:?}", e.status);
    assert_eq!(e.status, ExecutionStatus::Cancelled);
    assert_eq!(e.error_message.as_deref(), Some("service shutdown"));
}

#[tokio::test]
async fn test_sandbox_artifacts_are_stored() {
    let dir = tempfile::tempdir().unwrap();
    let script = "printf 'console line' > output/console.log; printf 'png' > output/fail.png";
    let (engine, repo) = engine_with_runner(dir.path(), script, 2, 30);

    let id = submit_one(&engine, &repo);
    wait_terminal(&repo, id).await;

    let files = repo.files_for_execution(id).unwrap();
    assert_eq!(files.len(), 2);
    let log = files.iter().find(|f| f.file_type == FileType::Log).unwrap();
    assert!(log.compressed);
    let shot = files
        .iter()
        .find(|f| f.file_type == FileType::Screenshot)
        .unwrap();
    assert_eq!(shot.file_name, "fail.png");

    let metrics = repo.metrics(id).unwrap().unwrap();
    assert_eq!(metrics.artifact_count, 2);

    // The sandbox itself is gone after processing.
    let sandbox_dir = dir.path().join("sandboxes").join(id.to_string());
    assert!(!sandbox_dir.exists());
}
