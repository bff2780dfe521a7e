//! Action handlers and their registry
//!
//! An action reads the execution context and returns an `ActionOutput` delta.
//! The engine commits the delta only when the step succeeds, so a failed step
//! never leaves a half-written context behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::BatchRunner;
use crate::context::{Dataset, ExecutionContext, ProvenanceRecord, Record};
use crate::error::{OrchestratorError, Result};
use crate::matching::IdNormalizer;
use crate::progress::ProgressTracker;
use crate::resolver::{IdentifierResolver, ResolverRegistry};

// ═══════════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════════

/// Resolved (template-substituted) parameters of one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepParams {
    step: String,
    values: serde_json::Map<String, Value>,
}

impl StepParams {
    pub fn new(step: impl Into<String>, values: serde_json::Map<String, Value>) -> Self {
        Self {
            step: step.into(),
            values,
        }
    }

    pub fn from_value(step: impl Into<String>, value: &Value) -> Self {
        Self::new(step, value.as_object().cloned().unwrap_or_default())
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn missing(&self, key: &str, expected: &str) -> OrchestratorError {
        OrchestratorError::config(format!(
            "step '{}': parameter '{}' must be {}",
            self.step, key, expected
        ))
    }

    /// Required string parameter
    pub fn str(&self, key: &str) -> Result<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing(key, "a string"))
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.opt_str(key).unwrap_or(default)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Required array of objects
    pub fn rows(&self, key: &str) -> Result<Dataset> {
        let array = self
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| self.missing(key, "an array of objects"))?;
        array
            .iter()
            .map(|v| v.as_object().cloned().ok_or_else(|| self.missing(key, "an array of objects")))
            .collect()
    }

    /// Optional list of strings (a single string is a one-element list)
    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Output delta
// ═══════════════════════════════════════════════════════════════════════════

/// Changes an action asks the engine to commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    /// Inserted or replaced datasets
    pub datasets: BTreeMap<String, Dataset>,
    pub statistics: BTreeMap<String, Value>,
    pub output_files: BTreeMap<String, String>,
    /// Provenance details for this step
    pub details: Value,
    /// One-line progress message
    pub message: String,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: impl Into<String>, rows: Dataset) -> Self {
        self.datasets.insert(name.into(), rows);
        self
    }

    pub fn with_statistic(mut self, key: impl Into<String>, value: Value) -> Self {
        self.statistics.insert(key.into(), value);
        self
    }

    pub fn with_output_file(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.output_files.insert(key.into(), path.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Summary stored on the step record
    pub fn summary(&self) -> Value {
        let datasets: BTreeMap<&str, usize> = self
            .datasets
            .iter()
            .map(|(name, rows)| (name.as_str(), rows.len()))
            .collect();
        serde_json::json!({
            "datasets": datasets,
            "statistics": self.statistics,
            "output_files": self.output_files,
        })
    }

    /// Commit into `context` and append a provenance record for `action`
    pub fn apply(self, action: &str, context: &mut ExecutionContext) {
        context.datasets.extend(self.datasets);
        context.statistics.extend(self.statistics);
        context.output_files.extend(self.output_files);
        context.record_provenance(ProvenanceRecord::new(action, self.details));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Environment
// ═══════════════════════════════════════════════════════════════════════════

/// What a running step may use besides the context
#[derive(Clone)]
pub struct ActionEnv {
    pub job_id: Uuid,
    pub step_index: usize,
    pub step_name: String,
    pub cancel: CancellationToken,
    /// Sub-batch gate for fan-out work
    pub batch: BatchRunner,
    pub chunk_size: usize,
    pub progress: Arc<ProgressTracker>,
    pub resolvers: Arc<ResolverRegistry>,
    pub normalizer: IdNormalizer,
}

impl ActionEnv {
    pub fn resolver(&self, name: &str) -> Result<Arc<dyn IdentifierResolver>> {
        self.resolvers
            .get(name)
            .ok_or_else(|| OrchestratorError::config(format!("unknown resolver '{}'", name)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Input dataset lookup with a step-level error
pub fn require_dataset<'a>(context: &'a ExecutionContext, step: &str, name: &str) -> Result<&'a [Record]> {
    context
        .dataset(name)
        .map(Vec::as_slice)
        .ok_or_else(|| OrchestratorError::step_failed(step, format!("dataset '{}' not found", name)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Handler trait
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key, e.g. `MATCH_DATASETS`
    fn action_type(&self) -> &'static str;

    fn required_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Problems with `params`, checked before any step of the job runs
    fn validate_params(&self, params: &StepParams, _resolvers: &ResolverRegistry) -> Vec<String> {
        self.required_params()
            .iter()
            .filter(|key| !params.has(key))
            .map(|key| {
                format!(
                    "step '{}' ({}): missing required parameter '{}'",
                    params.step(),
                    self.action_type(),
                    key
                )
            })
            .collect()
    }

    async fn execute(
        &self,
        params: &StepParams,
        context: &ExecutionContext,
        env: &ActionEnv,
    ) -> Result<ActionOutput>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

type HandlerMap = HashMap<String, Arc<dyn ActionHandler>>;

/// Action type → handler
///
/// Lookups clone an `Arc` of the current table; `register` swaps in a new
/// table, so readers never block on a reload.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<Arc<HandlerMap>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action
    pub fn with_builtin_actions() -> Self {
        let registry = Self::new();
        for handler in crate::actions::builtin_actions() {
            registry.register(handler);
        }
        registry
    }

    /// Add or replace a handler
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        let mut guard = self.handlers.write();
        let mut next: HandlerMap = (**guard).clone();
        next.insert(handler.action_type().to_string(), handler);
        *guard = Arc::new(next);
    }

    pub fn resolve(&self, action_type: &str) -> Result<Arc<dyn ActionHandler>> {
        let table = self.handlers.read().clone();
        table
            .get(action_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownAction(action_type.to_string()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.read().contains_key(action_type)
    }

    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.action_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        fn action_type(&self) -> &'static str {
            "ECHO"
        }

        fn required_params(&self) -> &'static [&'static str] {
            &["message"]
        }

        async fn execute(
            &self,
            params: &StepParams,
            _context: &ExecutionContext,
            _env: &ActionEnv,
        ) -> Result<ActionOutput> {
            Ok(ActionOutput::new().with_statistic("echo", json!(params.str("message")?)))
        }
    }

    #[test]
    fn test_params_accessors() {
        let params = StepParams::from_value(
            "s",
            &json!({"name": "x", "n": 3, "flag": true, "rows": [{"id": "a"}], "list": "one", "none": null}),
        );
        assert_eq!(params.str("name").unwrap(), "x");
        assert!(params.str("n").is_err());
        assert_eq!(params.usize_or("n", 0), 3);
        assert!(params.bool_or("flag", false));
        assert_eq!(params.rows("rows").unwrap().len(), 1);
        assert!(params.rows("name").is_err());
        assert_eq!(params.str_list("list"), vec!["one".to_string()]);
        assert!(!params.has("none"));
        assert_eq!(params.str_or("missing", "dflt"), "dflt");
    }

    #[test]
    fn test_default_validation_reports_missing_params() {
        let problems = Echo.validate_params(&StepParams::from_value("say", &json!({})), &ResolverRegistry::new());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'message'"));
    }

    #[test]
    fn test_output_apply_appends_provenance() {
        let mut ctx = ExecutionContext::new();
        ActionOutput::new()
            .with_dataset("d", vec![json!({"id": 1}).as_object().cloned().unwrap()])
            .with_statistic("rows", json!(1))
            .with_output_file("report", "/tmp/report.tsv")
            .with_details(json!({"rows": 1}))
            .apply("CREATE_DATASET", &mut ctx);

        assert_eq!(ctx.datasets["d"].len(), 1);
        assert_eq!(ctx.statistics["rows"], 1);
        assert_eq!(ctx.output_files["report"], "/tmp/report.tsv");
        assert_eq!(ctx.provenance.len(), 1);
        assert_eq!(ctx.provenance[0].action, "CREATE_DATASET");
    }

    #[test]
    fn test_registry_register_and_resolve() {
        let registry = ActionRegistry::new();
        assert!(matches!(
            registry.resolve("ECHO"),
            Err(OrchestratorError::UnknownAction(_))
        ));

        registry.register(Arc::new(Echo));
        assert!(registry.contains("ECHO"));
        assert_eq!(registry.resolve("ECHO").unwrap().action_type(), "ECHO");
    }

    #[test]
    fn test_builtin_actions_registered() {
        let registry = ActionRegistry::with_builtin_actions();
        for action in [
            "CREATE_DATASET",
            "MATCH_DATASETS",
            "COMPOSITE_MATCH",
            "RESOLVE_IDENTIFIERS",
            "BIDIRECTIONAL_VALIDATE",
            "AGGREGATE_RESULTS",
        ] {
            assert!(registry.contains(action), "{} missing", action);
        }
    }
}
