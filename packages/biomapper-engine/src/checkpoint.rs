use std::sync::Arc;

use biomapper_storage::{CheckpointKind, CheckpointRecord, JobStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};

fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Checkpoint manager over the persistence port
///
/// Snapshots are serialized copies of the execution context; the live context
/// can be mutated freely after `create` returns.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn JobStore>,
    max_snapshot_bytes: u64,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            max_snapshot_bytes: u64::MAX,
        }
    }

    /// Automatic snapshots larger than `bytes` are stored metadata-only (not
    /// resumable); manual ones are refused
    pub fn with_max_snapshot_bytes(mut self, bytes: u64) -> Self {
        self.max_snapshot_bytes = bytes;
        self
    }

    /// Persist a snapshot of `context` taken after step `step_index` finished
    pub async fn create(
        &self,
        job_id: Uuid,
        step_index: usize,
        step_name: &str,
        context: &ExecutionContext,
        kind: CheckpointKind,
    ) -> Result<Uuid> {
        let bytes = serde_json::to_vec(context).map_err(OrchestratorError::checkpoint)?;
        let size_bytes = bytes.len() as u64;
        let is_resumable = size_bytes <= self.max_snapshot_bytes;

        // A pause is only valid with a snapshot it can be resumed from
        if !is_resumable && kind == CheckpointKind::Manual {
            return Err(OrchestratorError::checkpoint(format!(
                "manual checkpoint for job {} step {} is {} bytes (limit {}), not resumable",
                job_id, step_index, size_bytes, self.max_snapshot_bytes
            )));
        }

        let (snapshot, digest) = if is_resumable {
            let digest = checksum(&bytes);
            (bytes, digest)
        } else {
            warn!(
                "Checkpoint for job {} step {} is {} bytes (limit {}), storing metadata only",
                job_id, step_index, size_bytes, self.max_snapshot_bytes
            );
            (Vec::new(), String::new())
        };

        let record = CheckpointRecord {
            id: Uuid::new_v4(),
            job_id,
            step_index,
            step_name: step_name.to_string(),
            snapshot,
            checksum: digest,
            created_at: Utc::now(),
            kind,
            is_resumable,
            size_bytes,
        };
        self.store
            .create_checkpoint(&record)
            .await
            .map_err(|e| OrchestratorError::checkpoint(format!("write failed: {}", e)))?;

        debug!(
            "Checkpoint {} ({}) written for job {} after step {} '{}' ({} bytes)",
            record.id,
            kind.as_str(),
            job_id,
            step_index,
            step_name,
            size_bytes
        );
        Ok(record.id)
    }

    pub async fn get_latest(&self, job_id: Uuid) -> Result<Option<CheckpointRecord>> {
        Ok(self.store.get_latest_checkpoint(job_id).await?)
    }

    pub async fn get(&self, checkpoint_id: Uuid) -> Result<CheckpointRecord> {
        self.store
            .get_checkpoint(checkpoint_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    OrchestratorError::CheckpointNotFound(checkpoint_id.to_string())
                } else {
                    e.into()
                }
            })
    }

    pub async fn list(&self, job_id: Uuid, limit: usize) -> Result<Vec<CheckpointRecord>> {
        Ok(self.store.list_checkpoints(job_id, limit).await?)
    }

    /// Rebuild the execution context and the index of the last completed step
    pub async fn restore(&self, checkpoint_id: Uuid) -> Result<(ExecutionContext, usize)> {
        let record = self.get(checkpoint_id).await?;
        let context = Self::decode(&record)?;
        Ok((context, record.step_index))
    }

    /// Decode and verify a checkpoint's snapshot
    pub fn decode(record: &CheckpointRecord) -> Result<ExecutionContext> {
        if !record.is_resumable {
            return Err(OrchestratorError::checkpoint(format!(
                "checkpoint {} is not resumable ({} bytes, metadata only)",
                record.id, record.size_bytes
            )));
        }
        let actual = checksum(&record.snapshot);
        if actual != record.checksum {
            return Err(OrchestratorError::checkpoint(format!(
                "checkpoint {} failed checksum verification",
                record.id
            )));
        }
        serde_json::from_slice(&record.snapshot).map_err(OrchestratorError::checkpoint)
    }

    /// Delete every checkpoint of a job
    pub async fn cleanup(&self, job_id: Uuid) -> Result<usize> {
        let removed = self.store.delete_checkpoints(job_id).await?;
        if removed > 0 {
            info!("Removed {} checkpoints of job {}", removed, job_id);
        }
        Ok(removed)
    }

    /// Delete checkpoints of all jobs older than `days`
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let removed = self.store.cleanup_older_than(days).await?;
        info!("Checkpoint retention: removed {} older than {} days", removed, days);
        Ok(removed)
    }
}
