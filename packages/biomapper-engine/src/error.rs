use biomapper_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Checkpoint write/read failure (fatal for pause/resume)
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid strategy or parameters, detected before any step runs
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        details: Vec<String>,
    },

    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Step '{step}' failed: {message}")]
    StepExecutionFailed { step: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    /// External identifier resolver failure
    #[error("Resolver '{resolver}' failed: {message}")]
    Resolver { resolver: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Configuration {
            message: e.to_string(),
            details: Vec::new(),
        }
    }

    pub fn checkpoint<E: std::fmt::Display>(e: E) -> Self {
        Self::Checkpoint(e.to_string())
    }

    pub fn step_failed(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::StepExecutionFailed {
            step: step.into(),
            message: message.to_string(),
        }
    }

    /// Retry classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Timeout(_) | OrchestratorError::Resolver { .. } => {
                ErrorCategory::Transient
            }
            OrchestratorError::Storage(e) if !e.is_not_found() => ErrorCategory::Infrastructure,
            OrchestratorError::Io(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Short machine-readable name, used in result entries and job error details
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::Storage(_) => "storage",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::InvalidStateTransition { .. } => "invalid_state_transition",
            OrchestratorError::JobNotFound(_) => "job_not_found",
            OrchestratorError::CheckpointNotFound(_) => "checkpoint_not_found",
            OrchestratorError::Checkpoint(_) => "checkpoint",
            OrchestratorError::Configuration { .. } => "configuration",
            OrchestratorError::UnknownAction(_) => "unknown_action",
            OrchestratorError::StepExecutionFailed { .. } => "step_execution",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::Resolver { .. } => "resolver",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Other(_) => "other",
        }
    }

    /// Structured details stored on a failed job
    pub fn details(&self) -> serde_json::Value {
        let mut details = serde_json::json!({
            "error_type": self.error_type(),
            "category": self.category().as_str(),
        });
        if let OrchestratorError::Configuration { details: items, .. } = self {
            details["problems"] = serde_json::json!(items);
        }
        if let OrchestratorError::StepExecutionFailed { step, .. } = self {
            details["step"] = serde_json::json!(step);
        }
        details
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, resolver outage)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, parse error)
    Permanent,
    /// Infrastructure error - alert ops (e.g., storage unavailable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let parsed = ErrorCategory::from_str(category.as_str()).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            OrchestratorError::Timeout("slow".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            OrchestratorError::config("missing param").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            OrchestratorError::Storage(StorageError::database("down")).category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            OrchestratorError::Storage(StorageError::job_not_found("x")).category(),
            ErrorCategory::Permanent
        );
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }

    #[test]
    fn test_configuration_details() {
        let err = OrchestratorError::Configuration {
            message: "2 problems".into(),
            details: vec!["a".into(), "b".into()],
        };
        let details = err.details();
        assert_eq!(details["error_type"], "configuration");
        assert_eq!(details["problems"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_step_failed_message() {
        let err = OrchestratorError::step_failed("load", "file missing");
        assert_eq!(err.to_string(), "Step 'load' failed: file missing");
        assert_eq!(err.details()["step"], "load");
    }
}
