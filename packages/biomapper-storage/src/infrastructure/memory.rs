//! In-memory adapter for JobStore
//!
//! Process-local; everything lives behind one `parking_lot::RwLock`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{
    CheckpointRecord, Job, JobFilter, JobStatusUpdate, JobStore, LogEntry, StepRecord,
};
use crate::{Result, StorageError};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    steps: Vec<StepRecord>,
    logs: Vec<LogEntry>,
    // Insertion order doubles as the tie-breaker for "latest"
    checkpoints: Vec<CheckpointRecord>,
}

/// In-memory `JobStore`
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints across all jobs
    pub fn checkpoint_count(&self) -> usize {
        self.tables.read().checkpoints.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.jobs.contains_key(&job.id) {
            return Err(StorageError::conflict(format!(
                "Job already exists: {}",
                job.id
            )));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.tables
            .read()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StorageError::job_not_found(job_id))
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        let mut jobs: Vec<&Job> = tables.jobs.values().filter(|j| filter.matches(j)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(jobs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn update_job_status(&self, update: &JobStatusUpdate) -> Result<()> {
        let mut tables = self.tables.write();
        let job = tables
            .jobs
            .get_mut(&update.job_id)
            .ok_or_else(|| StorageError::job_not_found(update.job_id))?;
        update.apply(job);
        Ok(())
    }

    async fn append_step_result(&self, step: &StepRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.jobs.contains_key(&step.job_id) {
            return Err(StorageError::job_not_found(step.job_id));
        }
        tables.steps.push(step.clone());
        Ok(())
    }

    async fn list_step_results(&self, job_id: Uuid) -> Result<Vec<StepRecord>> {
        Ok(self
            .tables
            .read()
            .steps
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.tables.write().logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>> {
        let tables = self.tables.read();
        let logs: Vec<&LogEntry> = tables.logs.iter().filter(|l| l.job_id == job_id).collect();
        let skip = logs.len().saturating_sub(limit);
        Ok(logs.into_iter().skip(skip).cloned().collect())
    }

    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.jobs.contains_key(&checkpoint.job_id) {
            return Err(StorageError::job_not_found(checkpoint.job_id));
        }
        if tables.checkpoints.iter().any(|cp| cp.id == checkpoint.id) {
            return Err(StorageError::conflict(format!(
                "Checkpoint already exists: {}",
                checkpoint.id
            )));
        }
        tables.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: Uuid) -> Result<CheckpointRecord> {
        self.tables
            .read()
            .checkpoints
            .iter()
            .find(|cp| cp.id == checkpoint_id)
            .cloned()
            .ok_or_else(|| StorageError::checkpoint_not_found(checkpoint_id))
    }

    async fn get_latest_checkpoint(&self, job_id: Uuid) -> Result<Option<CheckpointRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .checkpoints
            .iter()
            .enumerate()
            .filter(|(_, cp)| cp.job_id == job_id)
            .max_by_key(|(seq, cp)| (cp.created_at, *seq))
            .map(|(_, cp)| cp.clone()))
    }

    async fn list_checkpoints(&self, job_id: Uuid, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let tables = self.tables.read();
        let mut checkpoints: Vec<(usize, &CheckpointRecord)> = tables
            .checkpoints
            .iter()
            .enumerate()
            .filter(|(_, cp)| cp.job_id == job_id)
            .collect();
        checkpoints.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));

        Ok(checkpoints
            .into_iter()
            .take(limit)
            .map(|(_, cp)| cp.clone())
            .collect())
    }

    async fn delete_checkpoints(&self, job_id: Uuid) -> Result<usize> {
        let mut tables = self.tables.write();
        let before = tables.checkpoints.len();
        tables.checkpoints.retain(|cp| cp.job_id != job_id);
        Ok(before - tables.checkpoints.len())
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut tables = self.tables.write();
        let Tables { jobs, checkpoints, .. } = &mut *tables;
        let before = checkpoints.len();
        // Jobs that may still resume keep their history
        checkpoints.retain(|cp| {
            cp.created_at >= cutoff || jobs.get(&cp.job_id).is_some_and(|job| !job.is_terminal())
        });
        Ok(before - checkpoints.len())
    }
}
