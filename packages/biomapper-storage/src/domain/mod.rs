//! Domain layer for the job store
//!
//! # Domain Models
//!
//! - `Job`: one execution of a mapping strategy, with its lifecycle status
//! - `StepRecord`: the finished result of one strategy step (append-only)
//! - `LogEntry`: job-scoped log line (append-only)
//! - `CheckpointRecord`: serialized execution-context snapshot at a step boundary
//!
//! # Port Trait
//!
//! - `JobStore`: the only way the engine reaches persistence. The engine never
//!   issues raw queries.
//!
//! # Examples
//!
//! ```rust,ignore
//! use biomapper_storage::{InMemoryJobStore, Job, JobStore};
//!
//! async fn example(store: impl JobStore) -> Result<()> {
//!     let job = Job::new("protein_mapping", serde_json::json!({"steps": []}), 3);
//!     store.create_job(&job).await?;
//!
//!     let loaded = store.get_job(job.id).await?;
//!     assert_eq!(loaded.total_steps, 3);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════

/// Job lifecycle status
///
/// `Pending → Validating → Running → {Paused, Completed, Failed, Cancelled}`,
/// `Paused → Running`, and any non-terminal status may go to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Validating,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Validating => "validating",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "validating" => Ok(JobStatus::Validating),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(StorageError::serialization(format!(
                "Invalid job status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One execution of a mapping strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Strategy name (reference)
    pub strategy_name: String,
    /// Resolved strategy definition the job runs
    pub strategy: serde_json::Value,
    pub status: JobStatus,
    /// Index of the next step to run; equals `total_steps` once every step finished
    pub current_step_index: usize,
    pub total_steps: usize,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    /// Set when the job was restored from another job's checkpoint
    pub parent_job_id: Option<Uuid>,
    pub parent_checkpoint_id: Option<Uuid>,
}

impl Job {
    /// Create a new pending job
    pub fn new(
        strategy_name: impl Into<String>,
        strategy: serde_json::Value,
        total_steps: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy_name: strategy_name.into(),
            strategy,
            status: JobStatus::Pending,
            current_step_index: 0,
            total_steps,
            parameters: serde_json::Value::Null,
            options: serde_json::Value::Null,
            tags: Vec::new(),
            description: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            error_details: None,
            result: None,
            parent_job_id: None,
            parent_checkpoint_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Snapshot of the mutable lifecycle fields
    pub fn status_update(&self) -> JobStatusUpdate {
        JobStatusUpdate {
            job_id: self.id,
            status: self.status,
            current_step_index: self.current_step_index,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            error_details: self.error_details.clone(),
            result: self.result.clone(),
        }
    }
}

/// Lifecycle fields written by `JobStore::update_job_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub current_step_index: usize,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

impl JobStatusUpdate {
    /// Apply this update to a job record
    pub fn apply(&self, job: &mut Job) {
        job.status = self.status;
        job.current_step_index = self.current_step_index;
        job.updated_at = self.updated_at;
        job.started_at = self.started_at;
        job.completed_at = self.completed_at;
        job.error_message = self.error_message.clone();
        job.error_details = self.error_details.clone();
        job.result = self.result.clone();
    }
}

/// Filter for `JobStore::list_jobs` (all fields are AND-ed)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub strategy_name: Option<String>,
    pub tag: Option<String>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(name) = &self.strategy_name {
            if &job.strategy_name != name {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !job.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Steps and logs
// ═══════════════════════════════════════════════════════════════════════════

/// Final status of a strategy step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Failed, but the step was optional and execution continued
    FailedOptional,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::FailedOptional => "failed_optional",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "failed_optional" => Ok(StepStatus::FailedOptional),
            _ => Err(StorageError::serialization(format!(
                "Invalid step status: {}",
                s
            ))),
        }
    }
}

/// Result of one finished step (immutable once appended)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: Uuid,
    pub step_index: usize,
    pub name: String,
    pub action_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(default)]
    pub input_summary: serde_json::Value,
    #[serde(default)]
    pub output_summary: serde_json::Value,
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(StorageError::serialization(format!(
                "Invalid log level: {}",
                s
            ))),
        }
    }
}

/// Job-scoped log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub step_index: Option<usize>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl LogEntry {
    pub fn new(job_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step_index: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════════

/// How a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Written by the engine at a step boundary
    Automatic,
    /// Written on pause
    Manual,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Automatic => "automatic",
            CheckpointKind::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "automatic" => Ok(CheckpointKind::Automatic),
            "manual" => Ok(CheckpointKind::Manual),
            _ => Err(StorageError::serialization(format!(
                "Invalid checkpoint kind: {}",
                s
            ))),
        }
    }
}

/// Persisted checkpoint
///
/// `snapshot` is an opaque serialized execution context; the store never
/// looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Index of the last completed step
    pub step_index: usize,
    pub step_name: String,
    pub snapshot: Vec<u8>,
    /// Hex SHA-256 of `snapshot`
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub kind: CheckpointKind,
    pub is_resumable: bool,
    pub size_bytes: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: JobStore
// ═══════════════════════════════════════════════════════════════════════════

/// Persistence abstraction consumed by the execution engine
///
/// # Core Operations
///
/// 1. **Jobs**: `create_job`, `get_job`, `list_jobs`, `update_job_status`
/// 2. **Steps / logs** (append-only): `append_step_result`, `append_log`
/// 3. **Checkpoints**: `create_checkpoint`, `get_checkpoint`,
///    `get_latest_checkpoint`, `list_checkpoints`, `delete_checkpoints`,
///    `cleanup_older_than`
///
/// # Implementations
///
/// - `InMemoryJobStore`: process-local, for tests and embedded use
/// - `SqliteJobStore`: SQLite adapter (feature `sqlite`)
#[async_trait]
pub trait JobStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Job Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a new job
    ///
    /// # Errors
    ///
    /// Returns a `Conflict` error if a job with the same id already exists
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Get job by id
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job doesn't exist
    async fn get_job(&self, job_id: Uuid) -> Result<Job>;

    /// List jobs matching `filter`, newest first
    async fn list_jobs(&self, filter: &JobFilter, limit: usize, offset: usize) -> Result<Vec<Job>>;

    /// Write the lifecycle fields of a job
    async fn update_job_status(&self, update: &JobStatusUpdate) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════
    // Step / Log Operations
    // ═══════════════════════════════════════════════════════════════════════

    async fn append_step_result(&self, step: &StepRecord) -> Result<()>;

    /// Step results of a job in append order
    async fn list_step_results(&self, job_id: Uuid) -> Result<Vec<StepRecord>>;

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Most recent `limit` log entries of a job, oldest first
    async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoint Operations
    // ═══════════════════════════════════════════════════════════════════════

    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()>;

    /// # Errors
    ///
    /// Returns `CheckpointNotFound` if the checkpoint doesn't exist
    async fn get_checkpoint(&self, checkpoint_id: Uuid) -> Result<CheckpointRecord>;

    /// The most recently created checkpoint of a job (ties broken by insertion order)
    async fn get_latest_checkpoint(&self, job_id: Uuid) -> Result<Option<CheckpointRecord>>;

    /// Checkpoints of a job, newest first
    async fn list_checkpoints(&self, job_id: Uuid, limit: usize) -> Result<Vec<CheckpointRecord>>;

    /// Delete every checkpoint of a job, returning how many were removed
    async fn delete_checkpoints(&self, job_id: Uuid) -> Result<usize>;

    /// Delete checkpoints older than `days` days, returning how many were removed.
    /// Checkpoints of jobs that are not terminal are kept.
    async fn cleanup_older_than(&self, days: u32) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in &[
            JobStatus::Pending,
            JobStatus::Validating,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed = JobStatus::from_str(status.as_str()).unwrap();
            assert_eq!(*status, parsed);
        }
        assert!(JobStatus::from_str("sleeping").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("strategy", serde_json::json!({}), 4);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_step_index, 0);
        assert_eq!(job.total_steps, 4);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_status_update_apply() {
        let mut job = Job::new("strategy", serde_json::json!({}), 2);
        let mut other = job.clone();
        other.status = JobStatus::Failed;
        other.current_step_index = 1;
        other.error_message = Some("boom".to_string());

        other.status_update().apply(&mut job);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.current_step_index, 1);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_job_filter_matches() {
        let mut job = Job::new("protein", serde_json::json!({}), 1);
        job.tags = vec!["nightly".to_string()];

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::with_status(JobStatus::Pending).matches(&job));
        assert!(!JobFilter::with_status(JobStatus::Running).matches(&job));

        let by_tag = JobFilter {
            tag: Some("nightly".to_string()),
            ..Default::default()
        };
        assert!(by_tag.matches(&job));

        let by_name = JobFilter {
            strategy_name: Some("metabolite".to_string()),
            ..Default::default()
        };
        assert!(!by_name.matches(&job));
    }

    #[test]
    fn test_enum_string_roundtrips() {
        for kind in &[CheckpointKind::Automatic, CheckpointKind::Manual] {
            assert_eq!(CheckpointKind::from_str(kind.as_str()).unwrap(), *kind);
        }
        for status in &[
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::FailedOptional,
        ] {
            assert_eq!(StepStatus::from_str(status.as_str()).unwrap(), *status);
        }
        for level in &[LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()).unwrap(), *level);
        }
    }
}
