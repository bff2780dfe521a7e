//! Sequential step execution for one job
//!
//! The engine owns the execution context of the job it runs. Steps run
//! strictly in declaration order; a step's output is committed to the context
//! before the next step starts. Cancellation and pause requests are honoured
//! at step boundaries only, never in the middle of a step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use biomapper_storage::{
    CheckpointKind, Job, JobStatus, JobStore, LogEntry, LogLevel, StepRecord, StepStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionEnv, ActionHandler, ActionOutput, ActionRegistry, StepParams};
use crate::aggregator::ResultAggregator;
use crate::batch::BatchRunner;
use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, ExecutionOptions};
use crate::context::{ExecutionContext, ProvenanceRecord};
use crate::error::{OrchestratorError, Result};
use crate::job::JobStateMachine;
use crate::matching::IdNormalizer;
use crate::progress::ProgressTracker;
use crate::resolver::ResolverRegistry;
use crate::strategy::{Strategy, StrategyStep};

// ═══════════════════════════════════════════════════════════════════════════
// Run control
// ═══════════════════════════════════════════════════════════════════════════

/// Acknowledgement of a pause request: the manual checkpoint id, or why the job did not pause
pub type PauseAck = Result<Uuid>;

/// Pending pause request of one running job
#[derive(Debug, Default)]
pub struct PauseSignal {
    pending: Mutex<Option<oneshot::Sender<PauseAck>>>,
}

impl PauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to pause after its current step
    ///
    /// Returns `None` if another request is still waiting for its answer.
    pub fn request(&self) -> Option<oneshot::Receiver<PauseAck>> {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(tx);
        Some(rx)
    }

    pub fn is_requested(&self) -> bool {
        self.pending.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Live request, if any (abandoned requests are dropped)
    fn take(&self) -> Option<oneshot::Sender<PauseAck>> {
        self.pending.lock().take().filter(|tx| !tx.is_closed())
    }

    /// Answer a pending request that can no longer be honoured
    fn reject(&self, status: JobStatus) {
        if let Some(tx) = self.take() {
            let _ = tx.send(Err(OrchestratorError::InvalidStateTransition {
                from: status.as_str().to_string(),
                to: JobStatus::Paused.as_str().to_string(),
            }));
        }
    }
}

/// Signals a supervisor holds over a running job
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub pause: Arc<PauseSignal>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// A required step failed
    Failed { error: String },
    Cancelled,
    /// Stopped at a step boundary; resume continues at `next_step_index`
    Paused {
        checkpoint_id: Uuid,
        next_step_index: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Job record as last persisted
    pub job: Job,
    pub outcome: RunOutcome,
    pub context: ExecutionContext,
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Runs the steps of a strategy against one execution context
pub struct ExecutionEngine {
    store: Arc<dyn JobStore>,
    checkpoints: CheckpointStore,
    actions: Arc<ActionRegistry>,
    resolvers: Arc<ResolverRegistry>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        actions: Arc<ActionRegistry>,
        resolvers: Arc<ResolverRegistry>,
        config: EngineConfig,
    ) -> Self {
        let checkpoints = CheckpointStore::new(store.clone())
            .with_max_snapshot_bytes(config.checkpoint.max_snapshot_bytes);
        Self {
            store,
            checkpoints,
            actions,
            resolvers,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn resolvers(&self) -> &Arc<ResolverRegistry> {
        &self.resolvers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Substitute job parameters into `strategy` and validate the result
    ///
    /// Any problem here is a configuration error; no step has run yet.
    pub fn prepare(&self, strategy: &Strategy, parameters: &Value) -> Result<Strategy> {
        let resolved = strategy.resolve(parameters)?;
        resolved.validate(&self.actions, &self.resolvers)?;
        Ok(resolved)
    }

    /// Engine config with the job's `options` applied
    pub fn job_config(&self, job: &Job) -> Result<EngineConfig> {
        let options: ExecutionOptions = match &job.options {
            Value::Null => ExecutionOptions::default(),
            value => serde_json::from_value(value.clone()).map_err(OrchestratorError::serialization)?,
        };
        Ok(options.apply(&self.config))
    }

    /// Run steps `start_index..` of a job that is already `Running`
    ///
    /// Returns `Err` only when the job's state could not be persisted; step
    /// failures are reported through `RunOutcome::Failed`.
    pub async fn run(
        &self,
        job: Job,
        strategy: &Strategy,
        mut context: ExecutionContext,
        start_index: usize,
        control: &RunControl,
        progress: Arc<ProgressTracker>,
    ) -> Result<RunReport> {
        if job.status != JobStatus::Running {
            return Err(OrchestratorError::InvalidStateTransition {
                from: job.status.as_str().to_string(),
                to: JobStatus::Running.as_str().to_string(),
            });
        }
        let config = self.job_config(&job)?;
        let job_id = job.id;
        let total = strategy.steps.len();
        let run_start = Instant::now();
        let mut machine = JobStateMachine::new(job);

        let batch = BatchRunner::new(&config.batch, control.cancel.clone());
        let normalizer = IdNormalizer::new(config.normalization_prefixes.iter().cloned());

        self.log(
            job_id,
            LogLevel::Info,
            None,
            format!(
                "Running strategy '{}' from step {} of {}",
                strategy.name,
                start_index + 1,
                total
            ),
        )
        .await;

        let mut index = start_index;
        while index < total {
            if control.cancel.is_cancelled() {
                return self.finish_cancelled(machine, context, control, &progress).await;
            }

            let step = &strategy.steps[index];
            let env = ActionEnv {
                job_id,
                step_index: index,
                step_name: step.name.clone(),
                cancel: control.cancel.clone(),
                batch: batch.clone(),
                chunk_size: config.batch.chunk_size,
                progress: progress.clone(),
                resolvers: self.resolvers.clone(),
                normalizer: normalizer.clone(),
            };

            progress.step_started(index, &step.name);
            self.log(
                job_id,
                LogLevel::Info,
                Some(index),
                format!(
                    "Step {}/{} '{}' ({}) started",
                    index + 1,
                    total,
                    step.name,
                    step.action.action_type
                ),
            )
            .await;

            let params = step.params();
            let started_at = Utc::now();
            let step_start = Instant::now();
            let (result, retry_count) = self.execute_step(step, &params, &context, &env, &config).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let mut record = StepRecord {
                job_id,
                step_index: index,
                name: step.name.clone(),
                action_type: step.action.action_type.clone(),
                status: StepStatus::Completed,
                started_at,
                completed_at: Utc::now(),
                duration_ms,
                error_message: None,
                retry_count,
                input_summary: json!({ "params": params.as_value(), "context": context.summary() }),
                output_summary: Value::Null,
            };

            match result {
                Ok(output) => {
                    record.output_summary = output.summary();
                    let message = output.message.clone();
                    output.apply(&step.action.action_type, &mut context);
                    self.store.append_step_result(&record).await?;
                    progress.step_finished(index, &step.name, &message);
                    self.log(
                        job_id,
                        LogLevel::Info,
                        Some(index),
                        format!("Step '{}' completed in {}ms", step.name, duration_ms),
                    )
                    .await;
                }
                Err(e) if !step.is_required() => {
                    record.status = StepStatus::FailedOptional;
                    record.error_message = Some(e.to_string());
                    self.store.append_step_result(&record).await?;
                    context.record_provenance(ProvenanceRecord::new(
                        step.action.action_type.clone(),
                        json!({ "step": step.name, "status": "failed_optional", "error": e.to_string() }),
                    ));
                    progress.step_finished(index, &step.name, &format!("failed (optional): {}", e));
                    self.log(
                        job_id,
                        LogLevel::Warn,
                        Some(index),
                        format!("Optional step '{}' failed, continuing: {}", step.name, e),
                    )
                    .await;
                }
                Err(e) => {
                    record.status = StepStatus::Failed;
                    record.error_message = Some(e.to_string());
                    self.store.append_step_result(&record).await?;
                    return self
                        .finish_failed(machine, strategy, context, step, e, control, &progress)
                        .await;
                }
            }

            if config.checkpoint.every_step {
                if let Err(e) = self
                    .checkpoints
                    .create(job_id, index, &step.name, &context, CheckpointKind::Automatic)
                    .await
                {
                    // A missed automatic checkpoint only narrows what can be resumed
                    self.log(
                        job_id,
                        LogLevel::Warn,
                        Some(index),
                        format!("Automatic checkpoint after step '{}' failed: {}", step.name, e),
                    )
                    .await;
                }
            }

            index += 1;
            machine.advance(index)?;
            self.persist(&machine).await?;

            // Cancellation wins over a pending pause; the loop head handles it
            if index < total && !control.cancel.is_cancelled() {
                if let Some(ack) = control.pause.take() {
                    match self
                        .checkpoints
                        .create(job_id, index - 1, &step.name, &context, CheckpointKind::Manual)
                        .await
                    {
                        Ok(checkpoint_id) => {
                            machine.pause()?;
                            self.persist(&machine).await?;
                            progress.set_status(
                                JobStatus::Paused,
                                format!("Paused after step {} '{}'", index, step.name),
                            );
                            self.log(
                                job_id,
                                LogLevel::Info,
                                Some(index - 1),
                                format!(
                                    "Paused after step '{}' (checkpoint {})",
                                    step.name, checkpoint_id
                                ),
                            )
                            .await;
                            let _ = ack.send(Ok(checkpoint_id));
                            return Ok(RunReport {
                                job: machine.into_job(),
                                outcome: RunOutcome::Paused {
                                    checkpoint_id,
                                    next_step_index: index,
                                },
                                context,
                            });
                        }
                        Err(e) => {
                            self.log(
                                job_id,
                                LogLevel::Error,
                                Some(index - 1),
                                format!("Pause refused, manual checkpoint failed: {}", e),
                            )
                            .await;
                            let _ = ack.send(Err(e));
                        }
                    }
                }
            }
        }

        let result = self.build_result(strategy, &context, None);
        machine.complete(Some(result.clone()))?;
        self.persist(&machine).await?;
        control.pause.reject(JobStatus::Completed);
        progress.complete(result);
        self.log(
            job_id,
            LogLevel::Info,
            None,
            format!(
                "Job completed: {} steps in {:?}",
                total,
                run_start.elapsed()
            ),
        )
        .await;

        if config.checkpoint.cleanup_on_completion {
            if let Err(e) = self.checkpoints.cleanup(job_id).await {
                warn!("Checkpoint cleanup of completed job {} failed: {}", job_id, e);
            }
        }

        Ok(RunReport {
            job: machine.into_job(),
            outcome: RunOutcome::Completed,
            context,
        })
    }

    /// One step with its timeout and transient-error retries
    ///
    /// Returns the outcome and the number of retries spent.
    async fn execute_step(
        &self,
        step: &StrategyStep,
        params: &StepParams,
        context: &ExecutionContext,
        env: &ActionEnv,
        config: &EngineConfig,
    ) -> (Result<ActionOutput>, u32) {
        let handler: Arc<dyn ActionHandler> = match self.actions.resolve(&step.action.action_type) {
            Ok(handler) => handler,
            Err(e) => return (Err(e), 0),
        };
        let timeout = Duration::from_secs(step.timeout_secs.unwrap_or(config.step.timeout_secs).max(1));
        let max_retries = step.retries.unwrap_or(config.step.max_retries);
        let backoff = Duration::from_millis(config.step.retry_backoff_ms);

        let mut retries = 0;
        loop {
            let error = match tokio::time::timeout(timeout, handler.execute(params, context, env)).await {
                Ok(Ok(output)) => return (Ok(output), retries),
                Ok(Err(e)) => e,
                Err(_) => OrchestratorError::Timeout(format!(
                    "step '{}' exceeded {:?}",
                    step.name, timeout
                )),
            };

            if !error.category().is_retryable() || retries >= max_retries || env.is_cancelled() {
                return (Err(error), retries);
            }
            retries += 1;
            warn!(
                "Job {} step '{}' failed ({}), retry {}/{} in {:?}",
                env.job_id, step.name, error, retries, max_retries, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        mut machine: JobStateMachine,
        strategy: &Strategy,
        context: ExecutionContext,
        step: &StrategyStep,
        cause: OrchestratorError,
        control: &RunControl,
        progress: &ProgressTracker,
    ) -> Result<RunReport> {
        let job_id = machine.job().id;
        let error = match cause {
            e @ OrchestratorError::StepExecutionFailed { .. } => e,
            other => OrchestratorError::step_failed(&step.name, other),
        };
        let message = error.to_string();

        let result = self.build_result(strategy, &context, Some(&error));
        machine.fail(message.clone(), Some(error.details()), Some(result))?;
        self.persist(&machine).await?;
        control.pause.reject(JobStatus::Failed);
        progress.error(JobStatus::Failed, &message);
        self.log(
            job_id,
            LogLevel::Error,
            Some(machine.job().current_step_index),
            format!("Job failed: {}", message),
        )
        .await;

        Ok(RunReport {
            job: machine.into_job(),
            outcome: RunOutcome::Failed { error: message },
            context,
        })
    }

    async fn finish_cancelled(
        &self,
        mut machine: JobStateMachine,
        context: ExecutionContext,
        control: &RunControl,
        progress: &ProgressTracker,
    ) -> Result<RunReport> {
        let job_id = machine.job().id;
        machine.cancel("cancelled by request")?;
        self.persist(&machine).await?;
        control.pause.reject(JobStatus::Cancelled);

        if let Err(e) = self.checkpoints.cleanup(job_id).await {
            warn!("Checkpoint cleanup of cancelled job {} failed: {}", job_id, e);
        }
        progress.error(JobStatus::Cancelled, "Job cancelled");
        self.log(
            job_id,
            LogLevel::Info,
            Some(machine.job().current_step_index),
            format!(
                "Job cancelled before step {}",
                machine.job().current_step_index + 1
            ),
        )
        .await;

        Ok(RunReport {
            job: machine.into_job(),
            outcome: RunOutcome::Cancelled,
            context,
        })
    }

    /// Job result payload; carries the per-input mapping when the strategy declares one
    fn build_result(
        &self,
        strategy: &Strategy,
        context: &ExecutionContext,
        pipeline_error: Option<&OrchestratorError>,
    ) -> Value {
        let mut result = json!({
            "context": context.summary(),
            "statistics": context.statistics,
            "output_files": context.output_files,
        });

        let Some(spec) = &strategy.result else {
            return result;
        };
        let matches: Vec<String> = spec.matches_dataset.iter().cloned().collect();
        let errors: Vec<String> = spec.errors_dataset.iter().cloned().collect();
        match ResultAggregator::from_context(
            context,
            &spec.input_dataset,
            &spec.input_column,
            &matches,
            &errors,
        ) {
            Some(aggregator) => {
                let error = pipeline_error.map(|e| (e.error_type(), e.to_string()));
                let aggregated = aggregator.finish(error.as_ref().map(|(t, m)| (*t, m.as_str())));
                debug!(
                    "Aggregated {} inputs: {} matched, {} unmapped, {} errored",
                    aggregated.total(),
                    aggregated.matched,
                    aggregated.unmapped,
                    aggregated.errored
                );
                result["mapping"] = aggregated.to_value();
            }
            None => warn!(
                "Result input dataset '{}' not found, job result has no per-input mapping",
                spec.input_dataset
            ),
        }
        result
    }

    async fn persist(&self, machine: &JobStateMachine) -> Result<()> {
        self.store
            .update_job_status(&machine.job().status_update())
            .await?;
        Ok(())
    }

    /// Trace and append a job-scoped log line; a failed append is only warned about
    pub(crate) async fn log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        step_index: Option<usize>,
        message: String,
    ) {
        match level {
            LogLevel::Debug => debug!("Job {}: {}", job_id, message),
            LogLevel::Info => info!("Job {}: {}", job_id, message),
            LogLevel::Warn => warn!("Job {}: {}", job_id, message),
            LogLevel::Error => error!("Job {}: {}", job_id, message),
        }
        let mut entry = LogEntry::new(job_id, level, message);
        if let Some(index) = step_index {
            entry = entry.at_step(index);
        }
        if let Err(e) = self.store.append_log(&entry).await {
            warn!("Failed to append log entry for job {}: {}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use biomapper_storage::InMemoryJobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::strategy::ResultSpec;

    /// Appends the step name to the `trace` dataset
    struct Trace;

    #[async_trait]
    impl ActionHandler for Trace {
        fn action_type(&self) -> &'static str {
            "TRACE"
        }

        async fn execute(
            &self,
            params: &StepParams,
            context: &ExecutionContext,
            _env: &ActionEnv,
        ) -> Result<ActionOutput> {
            let mut rows = context.dataset("trace").cloned().unwrap_or_default();
            let mut row = crate::context::Record::new();
            row.insert("step".into(), json!(params.step()));
            rows.push(row);
            Ok(ActionOutput::new().with_dataset("trace", rows))
        }
    }

    /// Fails with a transient error until `succeed_after` calls were made
    struct Flaky {
        calls: AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl ActionHandler for Flaky {
        fn action_type(&self) -> &'static str {
            "FLAKY"
        }

        async fn execute(
            &self,
            _params: &StepParams,
            _context: &ExecutionContext,
            _env: &ActionEnv,
        ) -> Result<ActionOutput> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.succeed_after {
                Err(OrchestratorError::Timeout("upstream slow".into()))
            } else {
                Ok(ActionOutput::new().with_statistic("flaky", json!("ok")))
            }
        }
    }

    fn engine(store: Arc<InMemoryJobStore>, extra: Vec<Arc<dyn ActionHandler>>) -> ExecutionEngine {
        let actions = ActionRegistry::with_builtin_actions();
        actions.register(Arc::new(Trace));
        for handler in extra {
            actions.register(handler);
        }
        let mut config = EngineConfig::default();
        config.step.retry_backoff_ms = 1;
        ExecutionEngine::new(store, Arc::new(actions), Arc::new(ResolverRegistry::new()), config)
    }

    async fn running_job(store: &InMemoryJobStore, strategy: &Strategy) -> Job {
        let mut machine = JobStateMachine::new(Job::new(
            strategy.name.clone(),
            strategy.to_value().unwrap(),
            strategy.total_steps(),
        ));
        machine.begin_validation().unwrap();
        machine.start().unwrap();
        let job = machine.into_job();
        store.create_job(&job).await.unwrap();
        job
    }

    fn trace_steps(names: &[&str]) -> Vec<StrategyStep> {
        names
            .iter()
            .map(|name| StrategyStep::new(*name, "TRACE", json!({})))
            .collect()
    }

    fn tracker(job: &Job) -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(job.id, job.total_steps, 10))
    }

    #[tokio::test]
    async fn test_runs_all_steps_in_order() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let strategy = Strategy::new("s", trace_steps(&["a", "b", "c"]));
        let job = running_job(&store, &strategy).await;

        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &RunControl::new(), tracker(&job))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let trace: Vec<&str> = report.context.datasets["trace"]
            .iter()
            .filter_map(|r| r["step"].as_str())
            .collect();
        assert_eq!(trace, vec!["a", "b", "c"]);
        assert_eq!(report.context.provenance.len(), 3);

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.current_step_index, 3);
        assert_eq!(store.list_step_results(job.id).await.unwrap().len(), 3);
        assert_eq!(engine.checkpoints().list(job.id, 10).await.unwrap().len(), 3);
        assert!(!store.list_logs(job.id, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optional_failure_continues() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let mut steps = trace_steps(&["a"]);
        steps.push(
            StrategyStep::new("broken", "MATCH_DATASETS", json!({"source": "nope", "target": "nope", "output_key": "m"}))
                .optional(),
        );
        steps.extend(trace_steps(&["c"]));
        let strategy = Strategy::new("s", steps);
        let job = running_job(&store, &strategy).await;

        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &RunControl::new(), tracker(&job))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let steps = store.list_step_results(job.id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::FailedOptional);
        assert_eq!(steps[2].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_required_failure_keeps_partial_results() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let strategy = Strategy::new(
            "s",
            vec![
                StrategyStep::new("ids", "CREATE_DATASET", json!({"output_key": "ids", "ids": ["A", "B"]})),
                StrategyStep::new(
                    "hits",
                    "CREATE_DATASET",
                    json!({"output_key": "hits", "rows": [{"source_id": "A", "target_id": "X"}]}),
                ),
                StrategyStep::new("join", "MATCH_DATASETS", json!({"source": "ids", "target": "gone", "output_key": "m"})),
                StrategyStep::new("never", "TRACE", json!({})),
            ],
        )
        .with_result(ResultSpec {
            input_dataset: "ids".into(),
            input_column: "id".into(),
            matches_dataset: Some("hits".into()),
            errors_dataset: None,
        });
        let job = running_job(&store, &strategy).await;

        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &RunControl::new(), tracker(&job))
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_details.as_ref().unwrap()["step"], "join");

        let mapping = &stored.result.as_ref().unwrap()["mapping"];
        assert_eq!(mapping["matched"], 1);
        assert_eq!(mapping["errored"], 1);
        assert_eq!(store.list_step_results(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_step_failure_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            succeed_after: 2,
        });
        let engine = engine(store.clone(), vec![flaky.clone()]);
        let mut step = StrategyStep::new("flaky", "FLAKY", json!({}));
        step.retries = Some(2);
        let strategy = Strategy::new("s", vec![step]);
        let job = running_job(&store, &strategy).await;

        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &RunControl::new(), tracker(&job))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.list_step_results(job.id).await.unwrap()[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_pause_request_stops_at_boundary() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let strategy = Strategy::new("s", trace_steps(&["a", "b", "c"]));
        let job = running_job(&store, &strategy).await;

        let control = RunControl::new();
        let ack = control.pause.request().unwrap();
        assert!(control.pause.request().is_none());

        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &control, tracker(&job))
            .await
            .unwrap();

        let checkpoint_id = ack.await.unwrap().unwrap();
        assert_eq!(
            report.outcome,
            RunOutcome::Paused {
                checkpoint_id,
                next_step_index: 1
            }
        );
        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(stored.current_step_index, 1);

        let checkpoint = engine.checkpoints().get(checkpoint_id).await.unwrap();
        assert_eq!(checkpoint.kind, CheckpointKind::Manual);
        assert_eq!(checkpoint.step_index, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let strategy = Strategy::new("s", trace_steps(&["a", "b"]));
        let job = running_job(&store, &strategy).await;

        let control = RunControl::new();
        control.cancel.cancel();
        let report = engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &control, tracker(&job))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(store.list_step_results(job.id).await.unwrap().is_empty());
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_job_options_override_checkpointing() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), vec![]);
        let strategy = Strategy::new("s", trace_steps(&["a", "b"]));
        let mut job = running_job(&store, &strategy).await;
        job.options = json!({"checkpoint_every_step": false});

        engine
            .run(job.clone(), &strategy, ExecutionContext::new(), 0, &RunControl::new(), tracker(&job))
            .await
            .unwrap();
        assert!(engine.checkpoints().list(job.id, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_prepare_rejects_unknown_action() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store, vec![]);
        let strategy = Strategy::new("s", vec![StrategyStep::new("x", "NOPE", json!({}))]);
        assert!(matches!(
            engine.prepare(&strategy, &Value::Null),
            Err(OrchestratorError::Configuration { .. })
        ));
    }
}
