//! SQLite adapter for JobStore
//!
//! - One connection behind a `parking_lot::Mutex`; every call is a short
//!   synchronous statement, so nothing is held across an `.await`.
//! - Timestamps are stored as fixed-width RFC 3339 text (nanoseconds, `Z`),
//!   which keeps lexical order equal to time order.
//! - JSON columns are stored as TEXT, snapshots as BLOB.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{
    CheckpointKind, CheckpointRecord, Job, JobFilter, JobStatus, JobStatusUpdate, JobStore,
    LogEntry, LogLevel, StepRecord, StepStatus,
};
use crate::{Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                   TEXT PRIMARY KEY,
    strategy_name        TEXT NOT NULL,
    strategy             TEXT NOT NULL,
    status               TEXT NOT NULL,
    current_step_index   INTEGER NOT NULL,
    total_steps          INTEGER NOT NULL,
    parameters           TEXT NOT NULL,
    options              TEXT NOT NULL,
    tags                 TEXT NOT NULL,
    description          TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    started_at           TEXT,
    completed_at         TEXT,
    error_message        TEXT,
    error_details        TEXT,
    result               TEXT,
    parent_job_id        TEXT,
    parent_checkpoint_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

CREATE TABLE IF NOT EXISTS job_steps (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id         TEXT NOT NULL REFERENCES jobs(id),
    step_index     INTEGER NOT NULL,
    name           TEXT NOT NULL,
    action_type    TEXT NOT NULL,
    status         TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    completed_at   TEXT NOT NULL,
    duration_ms    INTEGER NOT NULL,
    error_message  TEXT,
    retry_count    INTEGER NOT NULL,
    input_summary  TEXT NOT NULL,
    output_summary TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_steps_job ON job_steps(job_id);

CREATE TABLE IF NOT EXISTS job_logs (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL,
    timestamp  TEXT NOT NULL,
    level      TEXT NOT NULL,
    message    TEXT NOT NULL,
    step_index INTEGER,
    details    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_job ON job_logs(job_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL UNIQUE,
    job_id       TEXT NOT NULL REFERENCES jobs(id),
    step_index   INTEGER NOT NULL,
    step_name    TEXT NOT NULL,
    snapshot     BLOB NOT NULL,
    checksum     TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    kind         TEXT NOT NULL,
    is_resumable INTEGER NOT NULL,
    size_bytes   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_job ON checkpoints(job_id, created_at);
"#;

const JOB_COLUMNS: &str = "id, strategy_name, strategy, status, current_step_index, total_steps, \
     parameters, options, tags, description, created_at, updated_at, started_at, completed_at, \
     error_message, error_details, result, parent_job_id, parent_checkpoint_id";

const CHECKPOINT_COLUMNS: &str = "id, job_id, step_index, step_name, snapshot, checksum, \
     created_at, kind, is_resumable, size_bytes";

/// SQLite-backed `JobStore`
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn).map_err(StorageError::from)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Column codecs
// ═══════════════════════════════════════════════════════════════════════════

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_to_sql)
}

fn json_to_sql(value: &serde_json::Value) -> String {
    value.to_string()
}

fn opt_json_to_sql(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(json_to_sql)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn usize_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(3)?;
    let tags: String = row.get(8)?;
    Ok(Job {
        id: uuid_col(row, 0)?,
        strategy_name: row.get(1)?,
        strategy: json_col(row, 2)?,
        status: JobStatus::from_str(&status).map_err(|e| conversion_error(3, e))?,
        current_step_index: usize_col(row, 4)?,
        total_steps: usize_col(row, 5)?,
        parameters: json_col(row, 6)?,
        options: json_col(row, 7)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(8, e))?,
        description: row.get(9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
        started_at: opt_ts_col(row, 12)?,
        completed_at: opt_ts_col(row, 13)?,
        error_message: row.get(14)?,
        error_details: opt_json_col(row, 15)?,
        result: opt_json_col(row, 16)?,
        parent_job_id: opt_uuid_col(row, 17)?,
        parent_checkpoint_id: opt_uuid_col(row, 18)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    let status: String = row.get(4)?;
    let duration_ms: i64 = row.get(7)?;
    let retry_count: i64 = row.get(9)?;
    Ok(StepRecord {
        job_id: uuid_col(row, 0)?,
        step_index: usize_col(row, 1)?,
        name: row.get(2)?,
        action_type: row.get(3)?,
        status: StepStatus::from_str(&status).map_err(|e| conversion_error(4, e))?,
        started_at: ts_col(row, 5)?,
        completed_at: ts_col(row, 6)?,
        duration_ms: u64::try_from(duration_ms).map_err(|e| conversion_error(7, e))?,
        error_message: row.get(8)?,
        retry_count: u32::try_from(retry_count).map_err(|e| conversion_error(9, e))?,
        input_summary: json_col(row, 10)?,
        output_summary: json_col(row, 11)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let level: String = row.get(2)?;
    let step_index: Option<i64> = row.get(4)?;
    Ok(LogEntry {
        job_id: uuid_col(row, 0)?,
        timestamp: ts_col(row, 1)?,
        level: LogLevel::from_str(&level).map_err(|e| conversion_error(2, e))?,
        message: row.get(3)?,
        step_index: step_index
            .map(|i| usize::try_from(i).map_err(|e| conversion_error(4, e)))
            .transpose()?,
        details: json_col(row, 5)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let kind: String = row.get(7)?;
    let is_resumable: i64 = row.get(8)?;
    let size_bytes: i64 = row.get(9)?;
    Ok(CheckpointRecord {
        id: uuid_col(row, 0)?,
        job_id: uuid_col(row, 1)?,
        step_index: usize_col(row, 2)?,
        step_name: row.get(3)?,
        snapshot: row.get(4)?,
        checksum: row.get(5)?,
        created_at: ts_col(row, 6)?,
        kind: CheckpointKind::from_str(&kind).map_err(|e| conversion_error(7, e))?,
        is_resumable: is_resumable != 0,
        size_bytes: u64::try_from(size_bytes).map_err(|e| conversion_error(9, e))?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// JobStore implementation
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let tags = serde_json::to_string(&job.tags)?;
        let sql = format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            JOB_COLUMNS
        );
        let conn = self.conn.lock();
        let inserted = conn.execute(
            &sql,
            params![
                job.id.to_string(),
                job.strategy_name,
                json_to_sql(&job.strategy),
                job.status.as_str(),
                job.current_step_index as i64,
                job.total_steps as i64,
                json_to_sql(&job.parameters),
                json_to_sql(&job.options),
                tags,
                job.description,
                ts_to_sql(&job.created_at),
                ts_to_sql(&job.updated_at),
                opt_ts_to_sql(&job.started_at),
                opt_ts_to_sql(&job.completed_at),
                job.error_message,
                opt_json_to_sql(&job.error_details),
                opt_json_to_sql(&job.result),
                job.parent_job_id.map(|id| id.to_string()),
                job.parent_checkpoint_id.map(|id| id.to_string()),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::conflict(format!(
                "Job already exists: {}",
                job.id
            ))
            .with_source(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        self.with_conn(|conn| {
            conn.query_row(&sql, params![job_id.to_string()], job_from_row)
                .optional()
        })?
        .ok_or_else(|| StorageError::job_not_found(job_id))
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR strategy_name = ?2)
               AND (?3 IS NULL OR EXISTS (SELECT 1 FROM json_each(jobs.tags) WHERE value = ?3))
             ORDER BY created_at DESC, id ASC
             LIMIT ?4 OFFSET ?5",
            JOB_COLUMNS
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.strategy_name,
                    filter.tag,
                    limit as i64,
                    offset as i64,
                ],
                job_from_row,
            )?;
            rows.collect()
        })
    }

    async fn update_job_status(&self, update: &JobStatusUpdate) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = ?2, current_step_index = ?3, updated_at = ?4,
                        started_at = ?5, completed_at = ?6, error_message = ?7,
                        error_details = ?8, result = ?9
                 WHERE id = ?1",
                params![
                    update.job_id.to_string(),
                    update.status.as_str(),
                    update.current_step_index as i64,
                    ts_to_sql(&update.updated_at),
                    opt_ts_to_sql(&update.started_at),
                    opt_ts_to_sql(&update.completed_at),
                    update.error_message,
                    opt_json_to_sql(&update.error_details),
                    opt_json_to_sql(&update.result),
                ],
            )
        })?;

        if changed == 0 {
            return Err(StorageError::job_not_found(update.job_id));
        }
        Ok(())
    }

    async fn append_step_result(&self, step: &StepRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_steps (job_id, step_index, name, action_type, status, started_at,
                        completed_at, duration_ms, error_message, retry_count, input_summary, output_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    step.job_id.to_string(),
                    step.step_index as i64,
                    step.name,
                    step.action_type,
                    step.status.as_str(),
                    ts_to_sql(&step.started_at),
                    ts_to_sql(&step.completed_at),
                    step.duration_ms as i64,
                    step.error_message,
                    i64::from(step.retry_count),
                    json_to_sql(&step.input_summary),
                    json_to_sql(&step.output_summary),
                ],
            )
        })?;
        Ok(())
    }

    async fn list_step_results(&self, job_id: Uuid) -> Result<Vec<StepRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, step_index, name, action_type, status, started_at, completed_at,
                        duration_ms, error_message, retry_count, input_summary, output_summary
                 FROM job_steps WHERE job_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![job_id.to_string()], step_from_row)?;
            rows.collect()
        })
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_logs (job_id, timestamp, level, message, step_index, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.job_id.to_string(),
                    ts_to_sql(&entry.timestamp),
                    entry.level.as_str(),
                    entry.message,
                    entry.step_index.map(|i| i as i64),
                    json_to_sql(&entry.details),
                ],
            )
        })?;
        Ok(())
    }

    async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>> {
        let mut logs = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, timestamp, level, message, step_index, details
                 FROM job_logs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![job_id.to_string(), limit as i64], log_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        logs.reverse();
        Ok(logs)
    }

    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO checkpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            CHECKPOINT_COLUMNS
        );
        let conn = self.conn.lock();
        let inserted = conn.execute(
            &sql,
            params![
                checkpoint.id.to_string(),
                checkpoint.job_id.to_string(),
                checkpoint.step_index as i64,
                checkpoint.step_name,
                checkpoint.snapshot,
                checkpoint.checksum,
                ts_to_sql(&checkpoint.created_at),
                checkpoint.kind.as_str(),
                checkpoint.is_resumable as i64,
                checkpoint.size_bytes as i64,
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StorageError::conflict(format!(
                "Checkpoint rejected (duplicate id or unknown job): {}",
                checkpoint.id
            ))
            .with_source(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_checkpoint(&self, checkpoint_id: Uuid) -> Result<CheckpointRecord> {
        let sql = format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS);
        self.with_conn(|conn| {
            conn.query_row(&sql, params![checkpoint_id.to_string()], checkpoint_from_row)
                .optional()
        })?
        .ok_or_else(|| StorageError::checkpoint_not_found(checkpoint_id))
    }

    async fn get_latest_checkpoint(&self, job_id: Uuid) -> Result<Option<CheckpointRecord>> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY created_at DESC, seq DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![job_id.to_string()], checkpoint_from_row)
                .optional()
        })
    }

    async fn list_checkpoints(&self, job_id: Uuid, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2",
            CHECKPOINT_COLUMNS
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(params![job_id.to_string(), limit as i64], checkpoint_from_row)?;
            rows.collect()
        })
    }

    async fn delete_checkpoints(&self, job_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM checkpoints WHERE job_id = ?1",
                params![job_id.to_string()],
            )
        })
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = ts_to_sql(&(Utc::now() - Duration::days(i64::from(days))));
        self.with_conn(|conn| {
            // Jobs that may still resume keep their history
            conn.execute(
                "DELETE FROM checkpoints WHERE created_at < ?1 AND job_id NOT IN \
                 (SELECT id FROM jobs WHERE status IN ('pending', 'validating', 'running', 'paused'))",
                params![cutoff],
            )
        })
    }
}
