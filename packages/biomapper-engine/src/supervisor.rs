//! Job control surface
//!
//! One spawned task per running job; jobs are independent of each other.
//! The supervisor keeps a handle per job (cancellation token, pause slot,
//! status watch, task handle) and a progress tracker per job while the job
//! is live; both are released once it reaches a terminal status. Lifecycle
//! status is always persisted through the `JobStore` before it is reported.

use std::sync::Arc;

use biomapper_storage::{
    CheckpointRecord, Job, JobFilter, JobStatus, JobStore, LogEntry, LogLevel, StepRecord,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::ExecutionOptions;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::job::JobStateMachine;
use crate::orchestrator::{ExecutionEngine, RunControl, RunOutcome};
use crate::progress::{ProgressCallback, ProgressEvent, ProgressSnapshot, ProgressTracker, SubscriptionId};
use crate::strategy::Strategy;

struct JobHandle {
    control: RunControl,
    status: watch::Sender<JobStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    fn new(status: JobStatus) -> Self {
        let (tx, _) = watch::channel(status);
        Self {
            control: RunControl::new(),
            status: tx,
            task: Mutex::new(None),
        }
    }

    fn set_status(&self, status: JobStatus) {
        self.status.send_replace(status);
    }
}

/// Starts, pauses, resumes, cancels and restores mapping jobs
#[derive(Clone)]
pub struct JobSupervisor {
    engine: Arc<ExecutionEngine>,
    handles: Arc<DashMap<Uuid, Arc<JobHandle>>>,
    trackers: Arc<DashMap<Uuid, Arc<ProgressTracker>>>,
}

impl JobSupervisor {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            handles: Arc::new(DashMap::new()),
            trackers: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.engine.store()
    }

    fn checkpoints(&self) -> &CheckpointStore {
        self.engine.checkpoints()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a job for `strategy` and start it
    ///
    /// A strategy that fails validation still yields a job id; that job is
    /// `Failed` with the configuration problems in its error details and no
    /// step has run.
    pub async fn execute(
        &self,
        strategy: &Strategy,
        parameters: Value,
        options: ExecutionOptions,
    ) -> Result<Uuid> {
        let mut job = Job::new(
            strategy.name.clone(),
            strategy.to_value()?,
            strategy.total_steps(),
        );
        job.parameters = parameters;
        job.options = serde_json::to_value(&options).map_err(OrchestratorError::serialization)?;
        job.tags = options.tags.clone();
        job.description = options
            .description
            .clone()
            .or_else(|| strategy.description.clone());
        self.store().create_job(&job).await?;
        let job_id = job.id;

        let tracker = self.tracker_for(job_id, job.total_steps);
        let mut machine = JobStateMachine::new(job);
        machine.begin_validation()?;
        self.persist(&machine).await?;
        tracker.set_status(JobStatus::Validating, "Validating strategy");

        let prepared = self.engine.prepare(strategy, &machine.job().parameters).and_then(|resolved| {
            options
                .apply(self.engine.config())
                .validate()
                .map_err(OrchestratorError::config)?;
            Ok(resolved)
        });
        let resolved = match prepared {
            Ok(resolved) => resolved,
            Err(e) => {
                let message = e.to_string();
                machine.fail(message.clone(), Some(e.details()), None)?;
                self.persist(&machine).await?;
                tracker.error(JobStatus::Failed, &message);
                self.trackers.remove(&job_id);
                self.log(job_id, LogLevel::Error, format!("Validation failed: {}", message))
                    .await;
                return Ok(job_id);
            }
        };

        machine.start()?;
        self.persist(&machine).await?;
        self.log(
            job_id,
            LogLevel::Info,
            format!(
                "Job started: strategy '{}' with {} steps",
                resolved.name,
                resolved.total_steps()
            ),
        )
        .await;

        self.spawn_run(machine.into_job(), resolved, ExecutionContext::new(), 0);
        Ok(job_id)
    }

    /// Ask a running job to stop after its current step
    ///
    /// Resolves once the job is paused and its manual checkpoint is written.
    /// `Ok(false)` when the job is not running (or finished before it could
    /// pause); `Err` when the pause checkpoint could not be written, in which
    /// case the job keeps running.
    pub async fn pause(&self, job_id: Uuid) -> Result<bool> {
        let Some(handle) = self.handle(job_id) else {
            self.load_job(job_id).await?;
            return Ok(false);
        };
        if *handle.status.borrow() != JobStatus::Running {
            return Ok(false);
        }
        let Some(ack) = handle.control.pause.request() else {
            return Ok(false);
        };
        info!("Pause requested for job {}", job_id);

        match ack.await {
            Ok(Ok(checkpoint_id)) => {
                info!("Job {} paused at checkpoint {}", job_id, checkpoint_id);
                Ok(true)
            }
            Ok(Err(OrchestratorError::InvalidStateTransition { from, .. })) => {
                info!("Job {} finished ({}) before it could pause", job_id, from);
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Continue a paused job from its latest checkpoint
    pub async fn resume(&self, job_id: Uuid) -> Result<bool> {
        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Ok(false);
        }
        if let Some(handle) = self.handle(job_id) {
            self.join_task(&handle).await;
        }

        let latest = self
            .checkpoints()
            .get_latest(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound(format!("latest of job {}", job_id)))?;
        let context = CheckpointStore::decode(&latest)?;
        let next_step = latest.step_index + 1;
        let strategy = self.job_strategy(&job)?;

        let mut machine = JobStateMachine::new(job);
        machine.start()?;
        machine.advance(next_step)?;
        self.persist(&machine).await?;

        let tracker = self.tracker_for(job_id, strategy.total_steps());
        tracker.set_status(
            JobStatus::Running,
            format!("Resumed from checkpoint {} at step {}", latest.id, next_step + 1),
        );
        self.log(
            job_id,
            LogLevel::Info,
            format!("Resumed from checkpoint {} at step {}", latest.id, next_step + 1),
        )
        .await;

        self.spawn_run(machine.into_job(), strategy, context, next_step);
        Ok(true)
    }

    /// Cancel a job that has not finished
    ///
    /// A running job stops at its next step boundary; a paused job is
    /// cancelled at once. Checkpoints of a cancelled job are removed.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let handle = self.handle(job_id);
        if let Some(handle) = &handle {
            handle.control.cancel.cancel();
        }

        let job = self.load_job(job_id).await?;
        match job.status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => Ok(false),
            JobStatus::Running if handle.is_some() => {
                info!("Cancellation requested for running job {}", job_id);
                Ok(true)
            }
            _ => {
                // A task that was just pausing sees the token and cancels the job itself
                if let Some(handle) = &handle {
                    self.join_task(handle).await;
                }
                let job = self.load_job(job_id).await?;
                if job.is_terminal() {
                    return Ok(job.status == JobStatus::Cancelled);
                }
                self.cancel_idle(job).await?;
                Ok(true)
            }
        }
    }

    /// Start a new job from a checkpoint of `job_id`
    ///
    /// The new job begins with the checkpoint's context and continues after
    /// its step; the source job and its history are left untouched.
    pub async fn restore_from_checkpoint(&self, job_id: Uuid, checkpoint_id: Uuid) -> Result<Uuid> {
        let record = self.checkpoints().get(checkpoint_id).await?;
        if record.job_id != job_id {
            return Err(OrchestratorError::config(format!(
                "checkpoint {} belongs to job {}, not {}",
                checkpoint_id, record.job_id, job_id
            )));
        }
        let source = self.load_job(job_id).await?;
        let strategy = self.job_strategy(&source)?;
        let context = CheckpointStore::decode(&record)?;
        let next_step = record.step_index + 1;

        let mut job = Job::new(
            source.strategy_name.clone(),
            source.strategy.clone(),
            source.total_steps,
        );
        job.parameters = source.parameters.clone();
        job.options = source.options.clone();
        job.tags = source.tags.clone();
        job.description = source.description.clone();
        job.current_step_index = next_step;
        job.parent_job_id = Some(job_id);
        job.parent_checkpoint_id = Some(checkpoint_id);
        self.store().create_job(&job).await?;
        let new_id = job.id;

        let mut machine = JobStateMachine::new(job);
        machine.begin_validation()?;
        machine.start()?;
        self.persist(&machine).await?;

        let tracker = self.tracker_for(new_id, strategy.total_steps());
        tracker.set_status(
            JobStatus::Running,
            format!("Restored from checkpoint {} of job {}", checkpoint_id, job_id),
        );
        self.log(
            new_id,
            LogLevel::Info,
            format!(
                "Restored from checkpoint {} of job {} at step {}",
                checkpoint_id,
                job_id,
                next_step + 1
            ),
        )
        .await;

        self.spawn_run(machine.into_job(), strategy, context, next_step);
        Ok(new_id)
    }

    /// Wait until the job is terminal or paused, then return its record
    pub async fn wait(&self, job_id: Uuid) -> Result<Job> {
        if let Some(handle) = self.handle(job_id) {
            let mut rx = handle.status.subscribe();
            // The sender lives in the handle, so the channel cannot close here
            let _ = rx
                .wait_for(|status| status.is_terminal() || *status == JobStatus::Paused)
                .await;
        }
        self.load_job(job_id).await
    }

    /// Cancel every running job and wait for their tasks
    ///
    /// Paused jobs stay paused and can be resumed by a later supervisor.
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, Arc<JobHandle>)> = self
            .handles
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        info!("Shutting down supervisor ({} jobs)", handles.len());
        for (job_id, handle) in &handles {
            // The stored status turns Paused before the pausing task exits
            let paused = matches!(
                self.load_job(*job_id).await,
                Ok(job) if job.status == JobStatus::Paused
            );
            if !paused {
                handle.control.cancel.cancel();
            }
        }
        for (job_id, handle) in &handles {
            let task = handle.task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!("Task of job {} ended abnormally: {}", job_id, e);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Progress
    // ═══════════════════════════════════════════════════════════════════════

    pub fn subscribe(&self, job_id: Uuid, callback: ProgressCallback) -> Result<SubscriptionId> {
        Ok(self.tracker(job_id)?.subscribe(callback))
    }

    pub fn unsubscribe(&self, job_id: Uuid, id: SubscriptionId) -> bool {
        self.trackers
            .get(&job_id)
            .map(|tracker| tracker.unsubscribe(id))
            .unwrap_or(false)
    }

    /// Progress events of a job as a channel (SSE/websocket bridges)
    pub fn subscribe_channel(&self, job_id: Uuid) -> Result<mpsc::UnboundedReceiver<ProgressEvent>> {
        Ok(self.tracker(job_id)?.subscribe_channel())
    }

    /// Live progress of a running or paused job; `None` once it has finished
    pub fn progress(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.trackers.get(&job_id).map(|tracker| tracker.snapshot())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.load_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter, limit: usize, offset: usize) -> Result<Vec<Job>> {
        Ok(self.store().list_jobs(filter, limit, offset).await?)
    }

    pub async fn list_steps(&self, job_id: Uuid) -> Result<Vec<StepRecord>> {
        Ok(self.store().list_step_results(job_id).await?)
    }

    pub async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self.store().list_logs(job_id, limit).await?)
    }

    pub async fn list_checkpoints(&self, job_id: Uuid, limit: usize) -> Result<Vec<CheckpointRecord>> {
        self.checkpoints().list(job_id, limit).await
    }

    /// Retention sweep over all jobs
    pub async fn cleanup_checkpoints(&self, days: u32) -> Result<usize> {
        self.checkpoints().cleanup_older_than(days).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn handle(&self, job_id: Uuid) -> Option<Arc<JobHandle>> {
        self.handles.get(&job_id).map(|entry| entry.value().clone())
    }

    fn tracker(&self, job_id: Uuid) -> Result<Arc<ProgressTracker>> {
        self.trackers
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    fn tracker_for(&self, job_id: Uuid, total_steps: usize) -> Arc<ProgressTracker> {
        let max_messages = self.engine.config().progress.max_messages;
        self.trackers
            .entry(job_id)
            .or_insert_with(|| Arc::new(ProgressTracker::new(job_id, total_steps, max_messages)))
            .value()
            .clone()
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job> {
        self.store().get_job(job_id).await.map_err(|e| {
            if e.is_not_found() {
                OrchestratorError::JobNotFound(job_id.to_string())
            } else {
                e.into()
            }
        })
    }

    /// Resolved strategy a stored job runs
    fn job_strategy(&self, job: &Job) -> Result<Arc<Strategy>> {
        let strategy = Strategy::from_json_value(job.strategy.clone())?;
        Ok(Arc::new(self.engine.prepare(&strategy, &job.parameters)?))
    }

    async fn persist(&self, machine: &JobStateMachine) -> Result<()> {
        self.store()
            .update_job_status(&machine.job().status_update())
            .await?;
        Ok(())
    }

    async fn log(&self, job_id: Uuid, level: LogLevel, message: String) {
        self.engine.log(job_id, level, None, message).await;
    }

    async fn join_task(&self, handle: &JobHandle) {
        let task = handle.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Job task ended abnormally: {}", e);
            }
        }
    }

    /// Cancel a job with no task running (paused, or never started)
    async fn cancel_idle(&self, job: Job) -> Result<()> {
        let job_id = job.id;
        let mut machine = JobStateMachine::new(job);
        machine.cancel("cancelled by request")?;
        self.persist(&machine).await?;
        if let Err(e) = self.checkpoints().cleanup(job_id).await {
            warn!("Checkpoint cleanup of cancelled job {} failed: {}", job_id, e);
        }
        if let Some(tracker) = self.trackers.get(&job_id) {
            tracker.error(JobStatus::Cancelled, "Job cancelled");
        }
        if let Some(handle) = self.handle(job_id) {
            handle.set_status(JobStatus::Cancelled);
            self.release(job_id, &handle);
        } else {
            self.trackers.remove(&job_id);
        }
        self.log(job_id, LogLevel::Info, "Job cancelled".to_string()).await;
        Ok(())
    }

    /// Run `job` from `start_index` on a new task
    fn spawn_run(
        &self,
        job: Job,
        strategy: impl Into<Arc<Strategy>>,
        context: ExecutionContext,
        start_index: usize,
    ) {
        let job_id = job.id;
        let strategy: Arc<Strategy> = strategy.into();
        let handle = Arc::new(JobHandle::new(JobStatus::Running));
        self.handles.insert(job_id, handle.clone());
        let tracker = self.tracker_for(job_id, strategy.total_steps());

        let supervisor = self.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let control = task_handle.control.clone();
            let report = supervisor
                .engine
                .run(job, &strategy, context, start_index, &control, tracker.clone())
                .await;

            match report {
                Ok(report) => {
                    if matches!(report.outcome, RunOutcome::Paused { .. })
                        && control.cancel.is_cancelled()
                    {
                        // Cancelled while the pause was being written
                        if let Err(e) = supervisor.cancel_idle(report.job).await {
                            error!("Failed to cancel paused job {}: {}", job_id, e);
                        }
                        task_handle.set_status(JobStatus::Cancelled);
                    } else {
                        task_handle.set_status(report.job.status);
                    }
                }
                Err(e) => {
                    error!("Job {} aborted: {}", job_id, e);
                    supervisor.abort(job_id, &e, &tracker).await;
                    task_handle.set_status(JobStatus::Failed);
                }
            }

            let finished = task_handle.status.borrow().is_terminal();
            if finished {
                supervisor.release(job_id, &task_handle);
            }
        });
        *handle.task.lock() = Some(task);
    }

    /// Drop the handle and tracker of a job that reached a terminal status
    ///
    /// Only `handle` is removed; a newer handle registered for the same job
    /// stays in place.
    fn release(&self, job_id: Uuid, handle: &Arc<JobHandle>) {
        self.handles
            .remove_if(&job_id, |_, current| Arc::ptr_eq(current, handle));
        self.trackers.remove(&job_id);
    }

    /// Best-effort failure record for a run that could not persist its own state
    async fn abort(&self, job_id: Uuid, cause: &OrchestratorError, tracker: &ProgressTracker) {
        let message = format!("engine error: {}", cause);
        match self.load_job(job_id).await {
            Ok(job) if !job.is_terminal() => {
                let mut machine = JobStateMachine::new(job);
                if machine.job().status == JobStatus::Paused {
                    // Paused → Failed is not a lifecycle edge; record it as cancelled
                    let _ = machine.cancel(message.clone());
                } else {
                    let _ = machine.fail(message.clone(), Some(cause.details()), None);
                }
                if let Err(e) = self.persist(&machine).await {
                    error!("Could not record failure of job {}: {}", job_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Could not load job {} after failure: {}", job_id, e),
        }
        tracker.error(JobStatus::Failed, &message);
    }
}

impl std::fmt::Debug for JobSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSupervisor")
            .field("jobs", &self.handles.len())
            .finish()
    }
}
