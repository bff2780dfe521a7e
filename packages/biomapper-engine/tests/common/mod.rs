//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use biomapper_engine::{
    ActionEnv, ActionHandler, ActionOutput, ActionRegistry, EngineConfig, ExecutionContext,
    ExecutionEngine, JobSupervisor, Record, ResolverRegistry, Result, StepParams, Strategy,
    StrategyStep,
};
use biomapper_storage::{InMemoryJobStore, JobStore};
use serde_json::json;
use tokio::sync::{Notify, Semaphore};

/// Appends the step name to the `trace` dataset and blocks on the gated step
/// until the test releases it
pub struct GatedTrace {
    gate_step: String,
    pub entered: Notify,
    release: Semaphore,
}

impl GatedTrace {
    pub fn new(gate_step: &str) -> Arc<Self> {
        Arc::new(Self {
            gate_step: gate_step.to_string(),
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    /// Never blocks
    pub fn open() -> Arc<Self> {
        Self::new("")
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl ActionHandler for GatedTrace {
    fn action_type(&self) -> &'static str {
        "TRACE"
    }

    async fn execute(
        &self,
        params: &StepParams,
        context: &ExecutionContext,
        _env: &ActionEnv,
    ) -> Result<ActionOutput> {
        if params.step() == self.gate_step {
            self.entered.notify_one();
            self.release
                .acquire()
                .await
                .expect("gate semaphore closed")
                .forget();
        }

        let mut rows = context.dataset("trace").cloned().unwrap_or_default();
        let mut row = Record::new();
        row.insert("step".into(), json!(params.step()));
        rows.push(row);
        Ok(ActionOutput::new()
            .with_dataset("trace", rows)
            .with_statistic("last_step", json!(params.step())))
    }
}

/// `s0` .. `s{n-1}`, all TRACE steps
pub fn trace_strategy(n: usize) -> Strategy {
    let steps = (0..n)
        .map(|i| StrategyStep::new(format!("s{}", i), "TRACE", json!({})))
        .collect();
    Strategy::new("trace", steps)
}

pub fn engine(
    store: Arc<dyn JobStore>,
    extra: Vec<Arc<dyn ActionHandler>>,
    resolvers: ResolverRegistry,
) -> ExecutionEngine {
    engine_with_config(store, extra, resolvers, test_config())
}

/// Defaults with short retry backoff
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.batch.backoff_ms = 5;
    config
}

pub fn engine_with_config(
    store: Arc<dyn JobStore>,
    extra: Vec<Arc<dyn ActionHandler>>,
    resolvers: ResolverRegistry,
    config: EngineConfig,
) -> ExecutionEngine {
    let actions = ActionRegistry::with_builtin_actions();
    for handler in extra {
        actions.register(handler);
    }
    ExecutionEngine::new(store, Arc::new(actions), Arc::new(resolvers), config)
}

pub fn supervisor(extra: Vec<Arc<dyn ActionHandler>>, resolvers: ResolverRegistry) -> JobSupervisor {
    JobSupervisor::new(Arc::new(engine(
        Arc::new(InMemoryJobStore::new()),
        extra,
        resolvers,
    )))
}

/// Step names recorded in the `trace` dataset
pub fn traced_steps(context: &ExecutionContext) -> Vec<String> {
    context
        .dataset("trace")
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("step").and_then(|v| v.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
