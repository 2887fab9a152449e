//! Execution record repository.
//!
//! Write contract for the engine: status transitions are guarded in SQL so
//! that a terminal write only succeeds from `running` and `queued -> running`
//! happens at most once. The loser of a completion/timeout race is a no-op.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::model::{
    Browser, Execution, ExecutionConfig, ExecutionDetail, ExecutionFile, ExecutionMetrics,
    ExecutionStatus, FileType, TestOutcome,
};
use crate::storage::Pool;

/// A guarded status update for `find_and_update`.
#[derive(Debug, Clone)]
pub struct StatusPatch {
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl StatusPatch {
    /// `queued -> running` transition, stamping the start time.
    pub fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        }
    }

    /// `running -> terminal` transition, stamping the completion time.
    pub fn terminal(status: ExecutionStatus, error_message: Option<String>) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status,
            started_at: None,
            completed_at: Some(Utc::now()),
            error_message,
        }
    }
}

/// Repository over the executions database.
#[derive(Clone)]
pub struct ExecutionRepo {
    pool: Pool,
}

impl ExecutionRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // -- executions ---------------------------------------------------------

    /// Insert a freshly submitted execution (status `queued`).
    pub fn insert(&self, e: &Execution) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO executions
                 (id, name, base_url, browser, script, config_json, submitted_by,
                  status, error_message, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                e.id.to_string(),
                e.name,
                e.base_url,
                e.browser.as_str(),
                e.script,
                serde_json::to_string(&e.config)?,
                e.submitted_by,
                e.status.as_str(),
                e.error_message,
                e.created_at.to_rfc3339(),
                e.started_at.map(|t| t.to_rfc3339()),
                e.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("failed to insert execution")?;
        Ok(())
    }

    pub fn find(&self, id: Uuid) -> Result<Option<Execution>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, browser, script, config_json, submitted_by,
                    status, error_message, created_at, started_at, completed_at
             FROM executions WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_execution(row)?)),
            None => Ok(None),
        }
    }

    /// Apply a guarded status transition. Returns `false` when the guard did
    /// not match (already transitioned), which callers treat as a no-op.
    pub fn find_and_update(&self, id: Uuid, patch: &StatusPatch) -> Result<bool> {
        let guard = match patch.status {
            ExecutionStatus::Running => "queued",
            _ => "running",
        };
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions
             SET status = ?2,
                 started_at = COALESCE(?3, started_at),
                 completed_at = COALESCE(?4, completed_at),
                 error_message = COALESCE(?5, error_message)
             WHERE id = ?1 AND status = ?6",
            params![
                id.to_string(),
                patch.status.as_str(),
                patch.started_at.map(|t| t.to_rfc3339()),
                patch.completed_at.map(|t| t.to_rfc3339()),
                patch.error_message,
                guard,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Oldest queued executions, up to `limit`. The queue poll loop feeds
    /// these to the engine; admission does the actual `queued -> running`
    /// claim, so reading here never races another submitter.
    pub fn next_queued(&self, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, browser, script, config_json, submitted_by,
                    status, error_message, created_at, started_at, completed_at
             FROM executions WHERE status = 'queued'
             ORDER BY created_at ASC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_execution(row)?);
        }
        Ok(out)
    }

    /// Most recent executions for the CLI listing.
    pub fn recent(&self, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, browser, script, config_json, submitted_by,
                    status, error_message, created_at, started_at, completed_at
             FROM executions ORDER BY created_at DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_execution(row)?);
        }
        Ok(out)
    }

    // -- metrics and details ------------------------------------------------

    pub fn insert_metrics(&self, m: &ExecutionMetrics) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO execution_metrics
                 (execution_id, total_tests, total_passed, total_failed, total_skipped,
                  total_duration_ms, avg_duration_ms, peak_memory_bytes, avg_cpu_percent,
                  artifact_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.execution_id.to_string(),
                m.total_tests,
                m.total_passed,
                m.total_failed,
                m.total_skipped,
                m.total_duration_ms,
                m.avg_duration_ms,
                m.peak_memory_bytes,
                m.avg_cpu_percent,
                m.artifact_count,
            ],
        )
        .context("failed to insert execution metrics")?;
        Ok(())
    }

    pub fn metrics(&self, execution_id: Uuid) -> Result<Option<ExecutionMetrics>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id, total_tests, total_passed, total_failed, total_skipped,
                    total_duration_ms, avg_duration_ms, peak_memory_bytes, avg_cpu_percent,
                    artifact_count
             FROM execution_metrics WHERE execution_id = ?1",
        )?;
        let mut rows = stmt.query(params![execution_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(ExecutionMetrics {
                execution_id: parse_uuid(row.get::<_, String>(0)?)?,
                total_tests: row.get(1)?,
                total_passed: row.get(2)?,
                total_failed: row.get(3)?,
                total_skipped: row.get(4)?,
                total_duration_ms: row.get(5)?,
                avg_duration_ms: row.get(6)?,
                peak_memory_bytes: row.get(7)?,
                avg_cpu_percent: row.get(8)?,
                artifact_count: row.get(9)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert normalized per-test details in one batch. Returns row ids in
    /// input order so artifact rows can reference their owning detail.
    pub fn insert_details(&self, details: &[ExecutionDetail]) -> Result<Vec<i64>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(details.len());
        for d in details {
            tx.execute(
                "INSERT INTO execution_details
                     (execution_id, title, outcome, duration_ms, started_at, ended_at,
                      error_message, artifact_paths_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    d.execution_id.to_string(),
                    d.title,
                    d.outcome.as_str(),
                    d.duration_ms,
                    d.started_at.map(|t| t.to_rfc3339()),
                    d.ended_at.map(|t| t.to_rfc3339()),
                    d.error_message,
                    serde_json::to_string(&d.artifact_paths)?,
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn details(&self, execution_id: Uuid) -> Result<Vec<ExecutionDetail>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id, title, outcome, duration_ms, started_at, ended_at,
                    error_message, artifact_paths_json
             FROM execution_details WHERE execution_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![execution_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ExecutionDetail {
                execution_id: parse_uuid(row.get::<_, String>(0)?)?,
                title: row.get(1)?,
                outcome: TestOutcome::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(TestOutcome::Failed),
                duration_ms: row.get(3)?,
                started_at: parse_opt_ts(row.get::<_, Option<String>>(4)?),
                ended_at: parse_opt_ts(row.get::<_, Option<String>>(5)?),
                error_message: row.get(6)?,
                artifact_paths: serde_json::from_str(&row.get::<_, String>(7)?)
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    // -- artifact files -----------------------------------------------------

    pub fn insert_file(&self, f: &ExecutionFile) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO execution_files
                 (id, execution_id, detail_id, file_name, storage_key, file_type,
                  mime_type, size_bytes, compressed, original_size_bytes, expires_at,
                  created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                f.id.to_string(),
                f.execution_id.to_string(),
                f.detail_id,
                f.file_name,
                f.storage_key,
                f.file_type.as_str(),
                f.mime_type,
                f.size_bytes,
                f.compressed as i64,
                f.original_size_bytes,
                f.expires_at.map(|t| t.to_rfc3339()),
                f.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert execution file")?;
        Ok(())
    }

    pub fn find_file(&self, id: Uuid) -> Result<Option<ExecutionFile>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{FILE_COLUMNS} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_file(row)?)),
            None => Ok(None),
        }
    }

    pub fn files_for_execution(&self, execution_id: Uuid) -> Result<Vec<ExecutionFile>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{FILE_COLUMNS} WHERE execution_id = ?1 ORDER BY created_at ASC"
        ))?;
        let mut rows = stmt.query(params![execution_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_file(row)?);
        }
        Ok(out)
    }

    pub fn delete_file(&self, id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM execution_files WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Files whose expiration timestamp has passed, oldest first.
    pub fn expired_files(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionFile>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{FILE_COLUMNS}
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![now.to_rfc3339(), limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_file(row)?);
        }
        Ok(out)
    }

    /// Files whose owning execution row no longer exists.
    pub fn orphan_files(&self, limit: usize) -> Result<Vec<ExecutionFile>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT f.id, f.execution_id, f.detail_id, f.file_name, f.storage_key,
                    f.file_type, f.mime_type, f.size_bytes, f.compressed,
                    f.original_size_bytes, f.expires_at, f.created_at
             FROM execution_files f
             LEFT JOIN executions e ON e.id = f.execution_id
             WHERE e.id IS NULL
             ORDER BY f.created_at ASC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_file(row)?);
        }
        Ok(out)
    }
}

const FILE_COLUMNS: &str = "SELECT id, execution_id, detail_id, file_name, storage_key, \
     file_type, mime_type, size_bytes, compressed, original_size_bytes, expires_at, \
     created_at FROM execution_files";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_uuid(s: String) -> Result<Uuid> {
    Uuid::parse_str(&s).with_context(|| format!("invalid uuid in database: {s}"))
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_ts(s: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&s)
        .with_context(|| format!("invalid timestamp in database: {s}"))?
        .with_timezone(&Utc))
}

fn row_to_execution(row: &Row<'_>) -> Result<Execution> {
    let config: ExecutionConfig =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(Execution {
        id: parse_uuid(row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        browser: Browser::parse(&row.get::<_, String>(3)?).unwrap_or_default(),
        script: row.get(4)?,
        config,
        submitted_by: row.get(6)?,
        status: ExecutionStatus::parse(&row.get::<_, String>(7)?)
            .unwrap_or(ExecutionStatus::Failed),
        error_message: row.get(8)?,
        created_at: parse_ts(row.get::<_, String>(9)?)?,
        started_at: parse_opt_ts(row.get::<_, Option<String>>(10)?),
        completed_at: parse_opt_ts(row.get::<_, Option<String>>(11)?),
    })
}

fn row_to_file(row: &Row<'_>) -> Result<ExecutionFile> {
    Ok(ExecutionFile {
        id: parse_uuid(row.get::<_, String>(0)?)?,
        execution_id: parse_uuid(row.get::<_, String>(1)?)?,
        detail_id: row.get(2)?,
        file_name: row.get(3)?,
        storage_key: row.get(4)?,
        file_type: FileType::parse(&row.get::<_, String>(5)?).unwrap_or(FileType::Other),
        mime_type: row.get(6)?,
        size_bytes: row.get(7)?,
        compressed: row.get::<_, i64>(8)? != 0,
        original_size_bytes: row.get(9)?,
        expires_at: parse_opt_ts(row.get::<_, Option<String>>(10)?),
        created_at: parse_ts(row.get::<_, String>(11)?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
