//! Process supervisor -- spawn, monitor, time out, and terminate the
//! external test-runner process for one job.
//!
//! The runner is spawned scoped to the job's sandbox with both output
//! streams captured. A resource sampler starts immediately after spawn, and
//! a wall-clock timer enforces the job's effective timeout. Timeout,
//! cancellation, and shutdown all terminate the child the same way:
//! SIGTERM first, SIGKILL after a grace window.

pub mod sampler;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::Execution;
use crate::report::model::RunnerReport;
use crate::sandbox::Sandbox;
use sampler::UsageCell;

// ---------------------------------------------------------------------------
// RawResult
// ---------------------------------------------------------------------------

/// What the runner process produced, before normalization.
#[derive(Debug)]
pub struct RawResult {
    /// Process exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Structured report, when one was readable from the sandbox.
    pub report: Option<RunnerReport>,
    pub duration: Duration,
}

/// How the supervised run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The process exited on its own; exit code may still be nonzero.
    Exited(RawResult),
    /// The wall-clock budget expired and the process was terminated.
    /// Any report fragment produced before the kill is carried along so
    /// partial results can still be persisted.
    TimedOut { limit: Duration, raw: RawResult },
    /// Terminated by shutdown or explicit cancellation.
    Cancelled { raw: RawResult },
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Spawns and monitors one runner process per job.
pub struct Supervisor {
    config: EngineConfig,
}

impl Supervisor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Effective wall-clock budget: per-job override else the global default.
    pub fn effective_timeout(&self, execution: &Execution) -> Duration {
        Duration::from_secs(
            execution
                .config
                .timeout_secs
                .unwrap_or(self.config.engine.default_timeout_secs),
        )
    }

    /// Run the external runner for `execution` inside `sandbox`.
    ///
    /// Spawn failure (executable missing, permission denied) fails
    /// immediately with [`EngineError::Spawn`] and starts no timer. All
    /// other paths return a [`RunOutcome`] after the child has been reaped
    /// and the sampler stopped.
    pub async fn run(
        &self,
        execution: &Execution,
        sandbox: &Sandbox,
        usage: UsageCell,
        terminate_rx: oneshot::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let runner = &self.config.runner;
        let mut child = tokio::process::Command::new(&runner.command)
            .args(&runner.args)
            .current_dir(&sandbox.root)
            .env("CI", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let start = tokio::time::Instant::now();
        let limit = self.effective_timeout(execution);
        let kill_grace = Duration::from_secs(self.config.engine.kill_grace_secs);

        info!(
            execution_id = %execution.id,
            pid = child.id(),
            timeout_secs = limit.as_secs(),
            "runner spawned"
        );

        // Resource sampling starts immediately and is detached from the
        // termination path.
        let sampler_handle = child.id().map(|pid| {
            sampler::spawn(
                pid,
                Duration::from_secs(self.config.engine.sample_interval_secs.max(1)),
                usage,
            )
        });

        // Drain both streams concurrently so the child can never block on a
        // full pipe.
        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let timeout = tokio::time::sleep(limit);
        tokio::pin!(timeout);
        tokio::pin!(terminate_rx);

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(execution_id = %execution.id, "cancellation requested, terminating runner");
                terminate_child(&mut child, kill_grace).await;
                RunEnd::Cancelled
            }

            _ = &mut terminate_rx => {
                debug!(execution_id = %execution.id, "terminate signal received");
                terminate_child(&mut child, kill_grace).await;
                RunEnd::Cancelled
            }

            _ = &mut timeout => {
                warn!(
                    execution_id = %execution.id,
                    limit_secs = limit.as_secs(),
                    "runner exceeded wall-clock budget, terminating"
                );
                terminate_child(&mut child, kill_grace).await;
                RunEnd::TimedOut
            }

            status = child.wait() => {
                match status {
                    Ok(exit) => RunEnd::Exited(exit.code().unwrap_or(-1)),
                    Err(e) => {
                        warn!(execution_id = %execution.id, error = %e, "failed to wait for runner");
                        RunEnd::Exited(-1)
                    }
                }
            }
        };

        // Sampling always stops before the caller can drop the job's
        // tracking entry; otherwise samples would leak into later jobs.
        if let Some(handle) = sampler_handle {
            handle.abort();
        }

        let duration = start.elapsed();
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let report = crate::report::read_report(&sandbox.report_path);

        let raw = |exit_code: i32| RawResult {
            exit_code,
            stdout,
            stderr,
            report,
            duration,
        };

        match outcome {
            RunEnd::Exited(code) => {
                info!(
                    execution_id = %execution.id,
                    exit_code = code,
                    duration_ms = duration.as_millis() as u64,
                    "runner exited"
                );
                Ok(RunOutcome::Exited(raw(code)))
            }
            RunEnd::TimedOut => Ok(RunOutcome::TimedOut {
                limit,
                raw: raw(-1),
            }),
            RunEnd::Cancelled => Ok(RunOutcome::Cancelled { raw: raw(-1) }),
        }
    }
}

enum RunEnd {
    Exited(i32),
    TimedOut,
    Cancelled,
}

fn drain(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace` for a clean exit, then sends
/// SIGKILL if the process is still running.
pub async fn terminate_child(child: &mut tokio::process::Child, grace: Duration) {
    // Try SIGTERM first (Unix only).
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            // Timed out waiting for graceful exit; force kill.
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
