//! Per-job sandbox provisioning.
//!
//! Each job gets an isolated working directory holding a minimal project
//! manifest, a generated runner configuration, and the sanitized test
//! script. The directory is exclusive to the job for its lifetime and is
//! removed only after processing completes.

pub mod sanitize;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::Execution;

/// A provisioned sandbox for one job.
#[derive(Debug)]
pub struct Sandbox {
    pub execution_id: Uuid,
    /// Sandbox root; the runner's working directory.
    pub root: PathBuf,
    /// Where the runner writes reports, screenshots, video, traces.
    pub output_dir: PathBuf,
    /// Expected location of the structured report.
    pub report_path: PathBuf,
}

impl Sandbox {
    /// Remove the sandbox directory. Errors are logged, not propagated:
    /// cleanup must never mask the job's real outcome.
    pub fn destroy(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            warn!(
                execution_id = %self.execution_id,
                path = %self.root.display(),
                error = %e,
                "failed to remove sandbox directory"
            );
        } else {
            debug!(execution_id = %self.execution_id, "sandbox removed");
        }
    }
}

/// Builds sandboxes and ensures the runner toolchain is usable.
pub struct Provisioner {
    config: EngineConfig,
}

impl Provisioner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Materialize the sandbox for `execution`: directory, project manifest,
    /// runner configuration, sanitized script. Fails with
    /// [`EngineError::EnvironmentSetup`] on any filesystem or toolchain
    /// problem; the supervisor is never invoked for a failed sandbox.
    pub async fn prepare(&self, execution: &Execution) -> Result<Sandbox, EngineError> {
        let root = Path::new(&self.config.engine.sandbox_root).join(execution.id.to_string());
        let output_dir = root.join("output");
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| EngineError::EnvironmentSetup(format!("create sandbox: {e}")))?;

        // Any failure past this point must not leak the partial directory;
        // the caller never gets a Sandbox handle to destroy.
        if let Err(e) = self.populate(execution, &root).await {
            if let Err(rm) = std::fs::remove_dir_all(&root) {
                warn!(
                    execution_id = %execution.id,
                    path = %root.display(),
                    error = %rm,
                    "failed to remove partial sandbox after provisioning error"
                );
            }
            return Err(e);
        }

        let report_path = root.join(&self.config.runner.report_file);
        info!(
            execution_id = %execution.id,
            path = %root.display(),
            "sandbox prepared"
        );
        Ok(Sandbox {
            execution_id: execution.id,
            root,
            output_dir,
            report_path,
        })
    }

    async fn populate(&self, execution: &Execution, root: &Path) -> Result<(), EngineError> {
        self.write_manifest(execution, root)?;
        self.write_runner_config(execution, root)?;
        self.write_script(execution, root)?;
        if self.config.runner.ensure_install {
            self.ensure_runner(root).await?;
        }
        Ok(())
    }

    /// Minimal `package.json` so the runner treats the sandbox as a project.
    fn write_manifest(&self, execution: &Execution, root: &Path) -> Result<(), EngineError> {
        let manifest = json!({
            "name": format!("testlane-job-{}", execution.id),
            "private": true,
            "version": "0.0.0",
        });
        write_file(&root.join("package.json"), &format!("{manifest:#}"))
    }

    /// Generated runner configuration: base URL, browser project, viewport,
    /// headless flag, per-test timeout, and output locations for the JSON
    /// report, screenshots, video, and network traces.
    fn write_runner_config(&self, execution: &Execution, root: &Path) -> Result<(), EngineError> {
        let cfg = &execution.config;
        let timeout_ms = cfg
            .timeout_secs
            .unwrap_or(self.config.engine.default_timeout_secs)
            * 1000;
        let settings = json!({
            "testDir": ".",
            "outputDir": "output",
            "timeout": timeout_ms,
            "reporter": [["json", { "outputFile": self.config.runner.report_file }]],
            "use": {
                "baseURL": execution.base_url,
                "browserName": execution.browser.as_str(),
                "headless": cfg.headless.unwrap_or(true),
                "viewport": {
                    "width": cfg.viewport_width.unwrap_or(1280),
                    "height": cfg.viewport_height.unwrap_or(720),
                },
                "screenshot": "only-on-failure",
                "video": "retain-on-failure",
                "trace": "retain-on-failure",
            },
        });
        let content = format!(
            "// Generated by testlane. Do not edit.\nmodule.exports = {settings:#};\n"
        );
        write_file(&root.join("playwright.config.js"), &content)
    }

    fn write_script(&self, execution: &Execution, root: &Path) -> Result<(), EngineError> {
        let (sanitized, hits) = sanitize::sanitize_script(&execution.script);
        if hits > 0 {
            warn!(
                execution_id = %execution.id,
                blocked = hits,
                "test script contained denied patterns"
            );
        }
        write_file(&root.join("test.spec.js"), &sanitized)
    }

    /// Verify the runner toolchain answers inside the sandbox; install it
    /// when it does not, bounded by the install timeout.
    async fn ensure_runner(&self, root: &Path) -> Result<(), EngineError> {
        if self.runner_available(root).await {
            return Ok(());
        }

        info!(path = %root.display(), "runner toolchain missing, installing");
        let install_timeout = Duration::from_secs(self.config.engine.install_timeout_secs);
        let mut cmd = tokio::process::Command::new("npm");
        cmd.args(["install", "--no-audit", "--no-fund", "@playwright/test"])
            .current_dir(root)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(install_timeout, async {
            cmd.output()
                .await
                .map_err(|e| EngineError::EnvironmentSetup(format!("npm install: {e}")))
        })
        .await
        .map_err(|_| {
            EngineError::EnvironmentSetup(format!(
                "runner install exceeded {}s",
                install_timeout.as_secs()
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::EnvironmentSetup(format!(
                "runner install failed: {}",
                stderr.trim()
            )));
        }

        if self.runner_available(root).await {
            Ok(())
        } else {
            Err(EngineError::EnvironmentSetup(
                "runner toolchain still unavailable after install".to_string(),
            ))
        }
    }

    async fn runner_available(&self, root: &Path) -> bool {
        let probe = tokio::process::Command::new(&self.config.runner.command)
            .arg(self.config.runner.args.first().map(String::as_str).unwrap_or("playwright"))
            .arg("--version")
            .current_dir(root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(Duration::from_secs(30), probe).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(error = %e, "runner version probe failed to spawn");
                false
            }
            Err(_) => {
                debug!("runner version probe timed out");
                false
            }
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), EngineError> {
    std::fs::write(path, content)
        .map_err(|e| EngineError::EnvironmentSetup(format!("write {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
