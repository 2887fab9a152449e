//! TOML configuration for the testlane engine.
//!
//! Layered model with compiled-in defaults, an environment variable override
//! for the config file path (`TESTLANE_CONFIG`), and a standard filesystem
//! location fallback.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::FileType;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the testlane process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub artifacts: ArtifactSection,
    #[serde(default)]
    pub s3: S3Section,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded testlane configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `TESTLANE_CONFIG` environment variable.
    /// 2. `/etc/testlane/testlane.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("TESTLANE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTLANE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/testlane/testlane.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Worker pool and supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Maximum number of concurrently running executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Wall-clock budget per execution unless the job overrides it.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Budget for installing the runner toolchain into a sandbox.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    /// Resource sampling interval while a job is running.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// How long SIGTERM gets before escalation to SIGKILL.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// How long shutdown waits for in-flight jobs to terminate.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Root directory for per-job sandboxes.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_secs: default_timeout_secs(),
            install_timeout_secs: default_install_timeout_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sandbox_root: default_sandbox_root(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_install_timeout_secs() -> u64 {
    300
}
fn default_sample_interval_secs() -> u64 {
    1
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_sandbox_root() -> String {
    "data/sandboxes".to_string()
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// External test-runner toolchain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Command used to invoke the runner (resolved via PATH).
    #[serde(default = "default_runner_command")]
    pub command: String,
    /// Arguments passed to the runner command.
    #[serde(default = "default_runner_args")]
    pub args: Vec<String>,
    /// Sandbox-relative path of the structured report the runner writes.
    #[serde(default = "default_report_file")]
    pub report_file: String,
    /// Verify (and if needed install) the runner toolchain before each job.
    /// Disable when the runner is known to be globally available.
    #[serde(default = "default_ensure_install")]
    pub ensure_install: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            args: default_runner_args(),
            report_file: default_report_file(),
            ensure_install: default_ensure_install(),
        }
    }
}

fn default_runner_command() -> String {
    "npx".to_string()
}
fn default_runner_args() -> Vec<String> {
    vec!["playwright".to_string(), "test".to_string()]
}
fn default_report_file() -> String {
    "output/report.json".to_string()
}
fn default_ensure_install() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Execution record database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/testlane.db".to_string()
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Artifact store and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSection {
    /// Storage provider: "local" or "s3".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base directory for the local filesystem provider.
    #[serde(default = "default_artifact_base")]
    pub base_path: String,
    /// Public base URL prefixed to signed local URLs.
    #[serde(default = "default_public_base")]
    pub public_base_url: String,
    /// Secret for HMAC-signed URL tokens.
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
    /// Artifacts above this size are compressed before storage.
    /// Log artifacts are always compressed.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: u64,
    /// Cron expression for the scheduled retention cleanup.
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
    /// Maximum files deleted per cleanup sweep.
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch_limit: usize,
    /// Retention in days, by artifact type.
    #[serde(default = "default_retention_video")]
    pub retention_days_video: i64,
    #[serde(default = "default_retention_screenshot")]
    pub retention_days_screenshot: i64,
    #[serde(default = "default_retention_log")]
    pub retention_days_log: i64,
    #[serde(default = "default_retention_report")]
    pub retention_days_report: i64,
    /// Signed URL lifetime in seconds, by artifact type.
    #[serde(default = "default_ttl_media")]
    pub url_ttl_media_secs: u64,
    #[serde(default = "default_ttl_report")]
    pub url_ttl_report_secs: u64,
    #[serde(default = "default_ttl_log")]
    pub url_ttl_log_secs: u64,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_path: default_artifact_base(),
            public_base_url: default_public_base(),
            signing_secret: default_signing_secret(),
            compress_threshold_bytes: default_compress_threshold(),
            cleanup_schedule: default_cleanup_schedule(),
            cleanup_batch_limit: default_cleanup_batch(),
            retention_days_video: default_retention_video(),
            retention_days_screenshot: default_retention_screenshot(),
            retention_days_log: default_retention_log(),
            retention_days_report: default_retention_report(),
            url_ttl_media_secs: default_ttl_media(),
            url_ttl_report_secs: default_ttl_report(),
            url_ttl_log_secs: default_ttl_log(),
        }
    }
}

impl ArtifactSection {
    /// Retention period for an artifact type, `None` meaning keep forever.
    pub fn retention_days(&self, file_type: FileType) -> Option<i64> {
        let days = match file_type {
            FileType::Video => self.retention_days_video,
            FileType::Screenshot => self.retention_days_screenshot,
            FileType::Log => self.retention_days_log,
            FileType::Report => self.retention_days_report,
            FileType::Trace | FileType::Other => self.retention_days_log,
        };
        (days > 0).then_some(days)
    }

    /// Signed URL lifetime for an artifact type. Failure evidence
    /// (screenshots, video) gets the longest window.
    pub fn url_ttl_secs(&self, file_type: FileType) -> u64 {
        match file_type {
            FileType::Video | FileType::Screenshot => self.url_ttl_media_secs,
            FileType::Report => self.url_ttl_report_secs,
            FileType::Log | FileType::Trace | FileType::Other => self.url_ttl_log_secs,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_artifact_base() -> String {
    "data/artifacts".to_string()
}
fn default_public_base() -> String {
    "http://localhost:8080/artifacts".to_string()
}
fn default_signing_secret() -> String {
    // Replaced at deploy time; the default only keeps dev setups working.
    "testlane-dev-secret".to_string()
}
fn default_compress_threshold() -> u64 {
    512 * 1024
}
fn default_cleanup_schedule() -> String {
    // Daily at 03:00 (sec min hour dom month dow).
    "0 0 3 * * *".to_string()
}
fn default_cleanup_batch() -> usize {
    100
}
fn default_retention_video() -> i64 {
    7
}
fn default_retention_screenshot() -> i64 {
    7
}
fn default_retention_log() -> i64 {
    3
}
fn default_retention_report() -> i64 {
    30
}
fn default_ttl_media() -> u64 {
    24 * 3600
}
fn default_ttl_report() -> u64 {
    12 * 3600
}
fn default_ttl_log() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

/// Credentials and endpoint for the S3-compatible provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Section {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
