//! Structured runner report model.
//!
//! Mirrors the Playwright JSON reporter shape: nested suite groups holding
//! specs, each spec holding test entries with one result per attempt.
//! Every field is optional or defaulted -- reports from older runner
//! versions parse into whatever subset is present, and anything that does
//! not parse at all falls back to the synthetic-outcome path.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Top-level report document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerReport {
    #[serde(default)]
    pub suites: Vec<ReportSuite>,
    #[serde(default)]
    pub stats: Option<ReportStats>,
}

/// Aggregate counters the runner reports; informational only -- the
/// normalizer recomputes totals from the flattened details.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportStats {
    #[serde(default)]
    pub expected: u32,
    #[serde(default)]
    pub unexpected: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub flaky: u32,
}

/// A suite group. Suites nest arbitrarily deep.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportSuite {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub suites: Vec<ReportSuite>,
    #[serde(default)]
    pub specs: Vec<ReportSpec>,
}

/// One spec (test declaration) inside a suite.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tests: Vec<ReportTest>,
}

/// One test entry; retries produce multiple results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportTest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub results: Vec<ReportTestResult>,
}

/// One attempt of a test.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportTestResult {
    #[serde(default)]
    pub status: Option<String>,
    /// Duration in milliseconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ReportError>,
    #[serde(default)]
    pub attachments: Vec<ReportAttachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportError {
    #[serde(default)]
    pub message: Option<String>,
}

/// A file the runner attached to a result (screenshot, video, trace).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportAttachment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
}
