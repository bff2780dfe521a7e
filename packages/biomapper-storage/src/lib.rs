//! biomapper-storage - persistence port for mapping jobs
//!
//! The execution engine reaches persistence only through the [`JobStore`]
//! trait: jobs and their lifecycle status, append-only step results and logs,
//! and checkpoints holding opaque execution-context snapshots.
//!
//! ## Adapters
//!
//! - [`InMemoryJobStore`]: process-local tables, used by tests and embedded runs
//! - `SqliteJobStore`: single-file SQLite database (feature `sqlite`, default)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use biomapper_storage::{InMemoryJobStore, Job, JobFilter, JobStatus, JobStore};
//!
//! let store = InMemoryJobStore::new();
//! let job = Job::new("protein_mapping", strategy_json, 5);
//! store.create_job(&job).await?;
//!
//! let running = store
//!     .list_jobs(&JobFilter::with_status(JobStatus::Running), 50, 0)
//!     .await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    CheckpointKind, CheckpointRecord, Job, JobFilter, JobStatus, JobStatusUpdate, JobStore,
    LogEntry, LogLevel, StepRecord, StepStatus,
};
pub use infrastructure::InMemoryJobStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteJobStore;
