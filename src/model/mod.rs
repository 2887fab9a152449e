//! Core data model: executions, per-test details, metrics, and artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
///
/// `queued -> running` happens at most once; only `running` executions may
/// reach a terminal state, and no execution ever re-enters `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ExecutionStatus::Queued),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Browser the runner should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chromium,
    Firefox,
    Webkit,
}

impl Default for Browser {
    fn default() -> Self {
        Browser::Chromium
    }
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chromium" => Some(Browser::Chromium),
            "firefox" => Some(Browser::Firefox),
            "webkit" => Some(Browser::Webkit),
            _ => None,
        }
    }
}

/// Free-form per-job execution settings supplied at submission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    /// Viewport width in pixels.
    #[serde(default)]
    pub viewport_width: Option<u32>,
    /// Viewport height in pixels.
    #[serde(default)]
    pub viewport_height: Option<u32>,
    /// Run the browser headless (default true).
    #[serde(default)]
    pub headless: Option<bool>,
    /// Per-job wall-clock timeout override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One request to run a test script against a target URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// Human-readable name for listings.
    pub name: String,
    /// Target base URL the script runs against.
    pub base_url: String,
    pub browser: Browser,
    /// Test script source text (sanitized before it reaches the sandbox).
    pub script: String,
    #[serde(default)]
    pub config: ExecutionConfig,
    /// Identity of the submitter (opaque to the engine).
    pub submitted_by: String,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Build a new queued execution with a fresh id.
    pub fn new(name: &str, base_url: &str, browser: Browser, script: &str, submitted_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            browser,
            script: script.to_string(),
            config: ExecutionConfig::default(),
            submitted_by: submitted_by.to_string(),
            status: ExecutionStatus::Queued,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Test outcomes and details
// ---------------------------------------------------------------------------

/// Canonical per-test outcome set. Unrecognized runner statuses map to
/// `Failed`, the conservative choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Pending,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
            TestOutcome::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(TestOutcome::Passed),
            "failed" => Some(TestOutcome::Failed),
            "skipped" => Some(TestOutcome::Skipped),
            "pending" => Some(TestOutcome::Pending),
            _ => None,
        }
    }
}

/// One row per individual test case, created in a batch during
/// result normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution_id: Uuid,
    pub title: String,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Sandbox-relative paths of artifacts tied to this test.
    #[serde(default)]
    pub artifact_paths: Vec<String>,
}

/// One-per-execution aggregate, written once at terminal state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_id: Uuid,
    pub total_tests: u32,
    pub total_passed: u32,
    pub total_failed: u32,
    pub total_skipped: u32,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub peak_memory_bytes: u64,
    pub avg_cpu_percent: f64,
    pub artifact_count: u32,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Classification of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Video,
    Screenshot,
    Log,
    Report,
    Trace,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Video => "video",
            FileType::Screenshot => "screenshot",
            FileType::Log => "log",
            FileType::Report => "report",
            FileType::Trace => "trace",
            FileType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(FileType::Video),
            "screenshot" => Some(FileType::Screenshot),
            "log" => Some(FileType::Log),
            "report" => Some(FileType::Report),
            "trace" => Some(FileType::Trace),
            "other" => Some(FileType::Other),
            _ => None,
        }
    }

    /// Classify a file by its extension. Used by the secondary sandbox scan
    /// for artifacts the report did not reference.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "webm" | "mp4" => FileType::Video,
            "png" | "jpg" | "jpeg" => FileType::Screenshot,
            "log" | "txt" => FileType::Log,
            "json" | "xml" | "html" => FileType::Report,
            "zip" => FileType::Trace,
            _ => FileType::Other,
        }
    }

    /// Default MIME type for this artifact class.
    pub fn mime_type(&self) -> &'static str {
        match self {
            FileType::Video => "video/webm",
            FileType::Screenshot => "image/png",
            FileType::Log => "text/plain",
            FileType::Report => "application/json",
            FileType::Trace => "application/zip",
            FileType::Other => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored artifact record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFile {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub detail_id: Option<i64>,
    pub file_name: String,
    /// Provider storage key (path under the provider's base).
    pub storage_key: String,
    pub file_type: FileType,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Whether the stored object is gzip-compressed.
    pub compressed: bool,
    /// Size before compression, when `compressed` is set.
    pub original_size_bytes: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["queued", "running", "completed", "failed", "cancelled"] {
            assert_eq!(ExecutionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ExecutionStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(FileType::from_extension("webm"), FileType::Video);
        assert_eq!(FileType::from_extension("PNG"), FileType::Screenshot);
        assert_eq!(FileType::from_extension("log"), FileType::Log);
        assert_eq!(FileType::from_extension("json"), FileType::Report);
        assert_eq!(FileType::from_extension("zip"), FileType::Trace);
        assert_eq!(FileType::from_extension("bin"), FileType::Other);
    }

    #[test]
    fn test_new_execution_is_queued() {
        let e = Execution::new("smoke", "https://example.test", Browser::Chromium, "// t", "ci");
        assert_eq!(e.status, ExecutionStatus::Queued);
        assert!(e.started_at.is_none());
        assert!(e.error_message.is_none());
    }
}
