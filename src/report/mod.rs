//! Result normalization pipeline.
//!
//! Turns whatever the runner produced into a canonical set of per-test
//! details, aggregate metrics, and artifact candidates. A structured report
//! is flattened; a missing or unreadable report degrades to one synthetic
//! outcome derived from the exit code. This fallback is an explicit
//! degraded mode, not a parsing error.

pub mod model;
pub mod scan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Duration as ChronoDuration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{ExecutionDetail, ExecutionMetrics, ExecutionStatus, FileType, TestOutcome};
use crate::sandbox::Sandbox;
use crate::supervisor::sampler::ResourceUsage;
use crate::supervisor::RawResult;
use model::{ReportSuite, RunnerReport};

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read and parse the runner's structured report. Absent or unparseable
/// reports return `None`; downstream falls back to the synthetic outcome.
pub fn read_report(path: &Path) -> Option<RunnerReport> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no structured report");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "report present but unparseable");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized output
// ---------------------------------------------------------------------------

/// An artifact file waiting to be persisted by the artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactCandidate {
    pub path: PathBuf,
    pub file_type: FileType,
    /// Index into `Normalized::details` of the owning test, when known.
    pub detail_index: Option<usize>,
}

/// Canonical result of one execution.
#[derive(Debug)]
pub struct Normalized {
    pub details: Vec<ExecutionDetail>,
    pub metrics: ExecutionMetrics,
    pub candidates: Vec<ArtifactCandidate>,
    /// `failed` if any detail failed, else `completed`.
    pub terminal_status: ExecutionStatus,
}

/// Normalize a raw runner result for `execution_id`.
pub fn normalize(
    execution_id: Uuid,
    raw: &RawResult,
    sandbox: &Sandbox,
    usage: &ResourceUsage,
) -> Normalized {
    let mut details = Vec::new();
    let mut candidates = Vec::new();

    match &raw.report {
        Some(report) => {
            flatten_report(execution_id, report, &sandbox.root, &mut details, &mut candidates);
            if details.is_empty() {
                // A report with no tests still counts as a degraded run.
                details.push(synthetic_detail(execution_id, raw));
            }
        }
        None => details.push(synthetic_detail(execution_id, raw)),
    }

    // Secondary scan: pick up artifacts the report never referenced.
    let known: HashSet<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
    for scanned in scan::scan_output_dir(&sandbox.output_dir, &sandbox.report_path, &known) {
        candidates.push(ArtifactCandidate {
            path: scanned.path,
            file_type: scanned.file_type,
            detail_index: None,
        });
    }

    let metrics = aggregate(execution_id, &details, usage, candidates.len() as u32);
    let terminal_status = if details.iter().any(|d| d.outcome == TestOutcome::Failed) {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Completed
    };

    Normalized {
        details,
        metrics,
        candidates,
        terminal_status,
    }
}

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// Map a runner-native status string to the canonical outcome set.
/// Unrecognized values map to `Failed`, the conservative choice.
fn map_status(status: Option<&str>) -> TestOutcome {
    match status {
        Some("passed") | Some("expected") => TestOutcome::Passed,
        Some("skipped") => TestOutcome::Skipped,
        Some("pending") | Some("flaky") => TestOutcome::Pending,
        _ => TestOutcome::Failed,
    }
}

fn flatten_report(
    execution_id: Uuid,
    report: &RunnerReport,
    sandbox_root: &Path,
    details: &mut Vec<ExecutionDetail>,
    candidates: &mut Vec<ArtifactCandidate>,
) {
    for suite in &report.suites {
        flatten_suite(execution_id, suite, &[], sandbox_root, details, candidates);
    }
}

fn flatten_suite(
    execution_id: Uuid,
    suite: &ReportSuite,
    parents: &[&str],
    sandbox_root: &Path,
    details: &mut Vec<ExecutionDetail>,
    candidates: &mut Vec<ArtifactCandidate>,
) {
    let mut path: Vec<&str> = parents.to_vec();
    if !suite.title.is_empty() {
        path.push(&suite.title);
    }

    for spec in &suite.specs {
        for test in &spec.tests {
            // The last result is the final attempt; retries before it are
            // not separate outcomes.
            let last = test.results.last();
            let status = last
                .and_then(|r| r.status.as_deref())
                .or(test.status.as_deref());

            let title = if path.is_empty() {
                spec.title.clone()
            } else {
                format!("{} > {}", path.join(" > "), spec.title)
            };

            let duration_ms = last
                .and_then(|r| r.duration)
                .map(|d| d.max(0.0) as u64)
                .unwrap_or(0);
            let started_at = last.and_then(|r| r.start_time);
            let ended_at =
                started_at.map(|t| t + ChronoDuration::milliseconds(duration_ms as i64));
            let error_message = last
                .and_then(|r| r.error.as_ref())
                .and_then(|e| e.message.clone());

            let mut artifact_paths = Vec::new();
            let detail_index = details.len();
            if let Some(result) = last {
                for attachment in &result.attachments {
                    let Some(p) = &attachment.path else { continue };
                    let resolved = resolve(sandbox_root, p);
                    artifact_paths.push(p.clone());
                    candidates.push(ArtifactCandidate {
                        path: resolved,
                        file_type: classify_attachment(&attachment.name, p),
                        detail_index: Some(detail_index),
                    });
                }
            }

            details.push(ExecutionDetail {
                execution_id,
                title,
                outcome: map_status(status),
                duration_ms,
                started_at,
                ended_at,
                error_message,
                artifact_paths,
            });
        }
    }

    for child in &suite.suites {
        flatten_suite(execution_id, child, &path, sandbox_root, details, candidates);
    }
}

fn classify_attachment(name: &str, path: &str) -> FileType {
    match name {
        "screenshot" => FileType::Screenshot,
        "video" => FileType::Video,
        "trace" => FileType::Trace,
        _ => Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(FileType::from_extension)
            .unwrap_or(FileType::Other),
    }
}

fn resolve(sandbox_root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        sandbox_root.join(p)
    }
}

/// Degraded-mode fallback: one outcome derived from the exit code, with
/// captured stderr as the failure message.
fn synthetic_detail(execution_id: Uuid, raw: &RawResult) -> ExecutionDetail {
    let passed = raw.exit_code == 0;
    ExecutionDetail {
        execution_id,
        title: "test run".to_string(),
        outcome: if passed {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        },
        duration_ms: raw.duration.as_millis() as u64,
        started_at: None,
        ended_at: None,
        error_message: (!passed).then(|| raw.stderr.trim().to_string()),
        artifact_paths: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

fn aggregate(
    execution_id: Uuid,
    details: &[ExecutionDetail],
    usage: &ResourceUsage,
    artifact_count: u32,
) -> ExecutionMetrics {
    let total_tests = details.len() as u32;
    let total_passed = details
        .iter()
        .filter(|d| d.outcome == TestOutcome::Passed)
        .count() as u32;
    let total_failed = details
        .iter()
        .filter(|d| d.outcome == TestOutcome::Failed)
        .count() as u32;
    let total_skipped = details
        .iter()
        .filter(|d| d.outcome == TestOutcome::Skipped)
        .count() as u32;
    let total_duration_ms: u64 = details.iter().map(|d| d.duration_ms).sum();
    let avg_duration_ms = if total_tests == 0 {
        0
    } else {
        total_duration_ms / u64::from(total_tests)
    };

    ExecutionMetrics {
        execution_id,
        total_tests,
        total_passed,
        total_failed,
        total_skipped,
        total_duration_ms,
        avg_duration_ms,
        peak_memory_bytes: usage.peak_memory_bytes,
        avg_cpu_percent: usage.avg_cpu_percent(),
        artifact_count,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
