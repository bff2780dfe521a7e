//! Strategy definitions
//!
//! A strategy is an ordered list of steps, each naming one action and its
//! parameters, plus default parameters used for `${...}` substitution.
//!
//! ```yaml
//! name: protein_mapping
//! parameters:
//!   separator: "_"
//! steps:
//!   - name: load
//!     action:
//!       type: CREATE_DATASET
//!       params: { output_key: source, rows: [{ id: "Q1" }] }
//!   - name: match
//!     action:
//!       type: COMPOSITE_MATCH
//!       params: { source: source, target: target, separator: "${parameters.separator}" }
//!     required: false
//! ```

use std::collections::HashSet;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionRegistry, StepParams};
use crate::error::{OrchestratorError, Result};
use crate::resolver::ResolverRegistry;

const PLACEHOLDER: &str = r"\$\{(?:parameters\.)?([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\}";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStep {
    pub name: String,
    pub action: ActionSpec,
    /// A failing required step fails the job; an optional one is logged and skipped
    #[serde(default = "default_true")]
    pub required: bool,
    /// Same as `required: false`
    #[serde(default)]
    pub continue_on_error: bool,
    /// Overrides `step.max_retries` for this step
    #[serde(default)]
    pub retries: Option<u32>,
    /// Overrides `step.timeout_secs` for this step
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StrategyStep {
    pub fn new(name: impl Into<String>, action_type: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            action: ActionSpec {
                action_type: action_type.into(),
                params,
            },
            required: true,
            continue_on_error: false,
            retries: None,
            timeout_secs: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn is_required(&self) -> bool {
        self.required && !self.continue_on_error
    }

    pub fn params(&self) -> StepParams {
        StepParams::from_value(&self.name, &self.action.params)
    }
}

/// Where the job's per-input result comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSpec {
    /// Dataset holding every input identifier
    pub input_dataset: String,
    pub input_column: String,
    /// Match rows (`source_id`, `target_id`, ...)
    #[serde(default)]
    pub matches_dataset: Option<String>,
    /// Rows of identifiers that failed (`id`, `error_type`, `error_message`)
    #[serde(default)]
    pub errors_dataset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Default parameter values
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    pub steps: Vec<StrategyStep>,
    #[serde(default)]
    pub result: Option<ResultSpec>,
}

impl Strategy {
    pub fn new(name: impl Into<String>, steps: Vec<StrategyStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: serde_json::Map::new(),
            steps,
            result: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_result(mut self, result: ResultSpec) -> Self {
        self.result = Some(result);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::config(format!("invalid strategy YAML: {}", e)))
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| OrchestratorError::config(format!("invalid strategy definition: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(OrchestratorError::serialization)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Substitute `${parameters.NAME}` / `${NAME}` in every step parameter
    ///
    /// `overrides` (the job's parameters) are laid over the strategy defaults.
    /// A placeholder spanning a whole string is replaced by the raw JSON value;
    /// an embedded one by its text form.
    pub fn resolve(&self, overrides: &Value) -> Result<Strategy> {
        let mut merged = self.parameters.clone();
        match overrides {
            Value::Object(map) => merged.extend(map.clone()),
            Value::Null => {}
            other => {
                return Err(OrchestratorError::config(format!(
                    "job parameters must be an object, got {}",
                    other
                )))
            }
        }

        let pattern = Regex::new(PLACEHOLDER).map_err(OrchestratorError::config)?;
        let mut unknown = Vec::new();
        let mut resolved = self.clone();
        resolved.parameters = merged.clone();

        for step in &mut resolved.steps {
            step.action.params = substitute(&step.action.params, &merged, &pattern, &mut unknown);
        }
        if let Some(result) = &mut resolved.result {
            for field in [&mut result.input_dataset, &mut result.input_column] {
                *field = substitute_str(field, &merged, &pattern, &mut unknown);
            }
        }

        if unknown.is_empty() {
            Ok(resolved)
        } else {
            unknown.sort();
            unknown.dedup();
            Err(OrchestratorError::Configuration {
                message: format!(
                    "strategy '{}' references unknown parameters: {}",
                    self.name,
                    unknown.join(", ")
                ),
                details: unknown,
            })
        }
    }

    /// Structural and per-action parameter checks; all problems are reported together
    pub fn validate(&self, actions: &ActionRegistry, resolvers: &ResolverRegistry) -> Result<()> {
        let mut problems = Vec::new();

        if self.steps.is_empty() {
            problems.push(format!("strategy '{}' has no steps", self.name));
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                problems.push(format!("step {} has an empty name", index + 1));
            } else if !names.insert(step.name.as_str()) {
                problems.push(format!("duplicate step name '{}'", step.name));
            }

            if !(step.action.params.is_object() || step.action.params.is_null()) {
                problems.push(format!("step '{}': params must be a mapping", step.name));
                continue;
            }

            match actions.resolve(&step.action.action_type) {
                Ok(handler) => problems.extend(handler.validate_params(&step.params(), resolvers)),
                Err(_) => problems.push(format!(
                    "step '{}': unknown action type '{}'",
                    step.name, step.action.action_type
                )),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Configuration {
                message: format!(
                    "strategy '{}' is invalid: {}",
                    self.name,
                    problems.join("; ")
                ),
                details: problems,
            })
        }
    }
}

fn lookup<'a>(params: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = params.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_str(
    s: &str,
    params: &serde_json::Map<String, Value>,
    pattern: &Regex,
    unknown: &mut Vec<String>,
) -> String {
    pattern
        .replace_all(s, |caps: &Captures| match lookup(params, &caps[1]) {
            Some(value) => as_text(value),
            None => {
                unknown.push(caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn substitute(
    value: &Value,
    params: &serde_json::Map<String, Value>,
    pattern: &Regex,
    unknown: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(s) => {
            // Whole-string placeholder keeps the JSON type of the parameter
            if let Some(caps) = pattern.captures(s) {
                if caps[0].len() == s.len() {
                    return match lookup(params, &caps[1]) {
                        Some(v) => v.clone(),
                        None => {
                            unknown.push(caps[1].to_string());
                            value.clone()
                        }
                    };
                }
            }
            Value::String(substitute_str(s, params, pattern, unknown))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(v, params, pattern, unknown))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params, pattern, unknown)))
                .collect(),
        ),
        other => other.clone(),
    }
}
