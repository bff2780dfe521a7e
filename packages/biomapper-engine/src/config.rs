//! Engine configuration
//!
//! Loaded from YAML; every field has a default so a partial file (or an
//! empty one) is valid. Per-job `ExecutionOptions` override a subset of it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

/// Per-step execution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Wall-clock limit for one step attempt
    pub timeout_secs: u64,
    /// Extra attempts for a step failing with a transient error
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            max_retries: 0,
            retry_backoff_ms: 1000,
        }
    }
}

/// Sub-batch concurrency gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Sub-batches in flight at once within one step
    pub max_concurrent: usize,
    pub chunk_size: usize,
    /// Attempts per sub-batch, including the first one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            chunk_size: 500,
            max_attempts: 3,
            backoff_ms: 500,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write an automatic checkpoint after every step
    pub every_step: bool,
    /// Automatic snapshots above this size are stored metadata-only (not
    /// resumable); a pause whose snapshot exceeds it is refused
    pub max_snapshot_bytes: u64,
    pub retention_days: u32,
    /// Drop a job's checkpoints once it completes
    pub cleanup_on_completion: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_step: true,
            max_snapshot_bytes: 256 * 1024 * 1024,
            retention_days: 7,
            cleanup_on_completion: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Bound of the rolling message log
    pub max_messages: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { max_messages: 100 }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub step: StepConfig,
    pub batch: BatchConfig,
    pub checkpoint: CheckpointConfig,
    pub progress: ProgressConfig,
    /// Prefixes stripped from identifiers before comparison (e.g. `UniProtKB:`)
    pub normalization_prefixes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step: StepConfig::default(),
            batch: BatchConfig::default(),
            checkpoint: CheckpointConfig::default(),
            progress: ProgressConfig::default(),
            normalization_prefixes: vec![
                "UniProtKB:".to_string(),
                "uniprot:".to_string(),
                "HMDB:".to_string(),
                "CHEBI:".to_string(),
                "KEGG:".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.step.timeout_secs == 0 {
            return Err(ConfigError::range_with_hint(
                "step.timeout_secs",
                self.step.timeout_secs,
                1,
                u64::MAX,
                "A step needs at least one second to run",
            ));
        }
        if self.batch.max_concurrent == 0 || self.batch.max_concurrent > 1024 {
            return Err(ConfigError::range_with_hint(
                "batch.max_concurrent",
                self.batch.max_concurrent,
                1,
                1024,
                "Use 1 to run sub-batches sequentially",
            ));
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigError::range_with_hint(
                "batch.chunk_size",
                self.batch.chunk_size,
                1,
                usize::MAX,
                "Typical resolver chunks are 100-1000 identifiers",
            ));
        }
        if self.batch.max_attempts == 0 || self.batch.max_attempts > 20 {
            return Err(ConfigError::range_with_hint(
                "batch.max_attempts",
                self.batch.max_attempts,
                1,
                20,
                "max_attempts counts the first attempt",
            ));
        }
        if self.batch.timeout_secs == 0 {
            return Err(ConfigError::range_with_hint(
                "batch.timeout_secs",
                self.batch.timeout_secs,
                1,
                u64::MAX,
                "",
            ));
        }
        if self.progress.max_messages == 0 {
            return Err(ConfigError::range_with_hint(
                "progress.max_messages",
                self.progress.max_messages,
                1,
                usize::MAX,
                "The message log keeps at least the latest message",
            ));
        }
        Ok(())
    }
}

/// Per-job overrides of `EngineConfig`, stored on the job as `options`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub checkpoint_every_step: Option<bool>,
    pub step_timeout_secs: Option<u64>,
    pub step_max_retries: Option<u32>,
    pub max_concurrent_batches: Option<usize>,
}

impl ExecutionOptions {
    /// Engine config with this job's overrides applied
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        let mut config = base.clone();
        if let Some(every_step) = self.checkpoint_every_step {
            config.checkpoint.every_step = every_step;
        }
        if let Some(timeout) = self.step_timeout_secs {
            config.step.timeout_secs = timeout.max(1);
        }
        if let Some(retries) = self.step_max_retries {
            config.step.max_retries = retries;
        }
        if let Some(concurrent) = self.max_concurrent_batches {
            config.batch.max_concurrent = concurrent.max(1);
        }
        config
    }
}
