use biomapper_storage::{Job, JobStatus};
use chrono::Utc;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Job state machine for transitions
///
/// ```text
/// Pending → Validating → Running → {Paused, Completed, Failed, Cancelled}
/// Paused → Running
/// any non-terminal → Cancelled
/// ```
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    fn invalid(&self, to: JobStatus) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.job.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.job.status = status;
        self.job.updated_at = Utc::now();
    }

    /// Transition: PENDING → VALIDATING
    pub fn begin_validation(&mut self) -> Result<()> {
        match self.job.status {
            JobStatus::Pending => {
                self.set_status(JobStatus::Validating);
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Validating)),
        }
    }

    /// Transition: VALIDATING | PAUSED → RUNNING
    pub fn start(&mut self) -> Result<()> {
        match self.job.status {
            JobStatus::Validating | JobStatus::Paused => {
                self.set_status(JobStatus::Running);
                if self.job.started_at.is_none() {
                    self.job.started_at = Some(self.job.updated_at);
                }
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Running)),
        }
    }

    /// Transition: RUNNING → PAUSED
    pub fn pause(&mut self) -> Result<()> {
        match self.job.status {
            JobStatus::Running => {
                self.set_status(JobStatus::Paused);
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Paused)),
        }
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&mut self, result: Option<Value>) -> Result<()> {
        match self.job.status {
            JobStatus::Running => {
                self.set_status(JobStatus::Completed);
                self.job.completed_at = Some(self.job.updated_at);
                self.job.current_step_index = self.job.total_steps;
                self.job.result = result;
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Completed)),
        }
    }

    /// Transition: PENDING | VALIDATING | RUNNING → FAILED
    ///
    /// `result` keeps whatever partial result was produced before the failure.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        details: Option<Value>,
        result: Option<Value>,
    ) -> Result<()> {
        match self.job.status {
            JobStatus::Pending | JobStatus::Validating | JobStatus::Running => {
                self.set_status(JobStatus::Failed);
                self.job.completed_at = Some(self.job.updated_at);
                self.job.error_message = Some(message.into());
                self.job.error_details = details;
                if result.is_some() {
                    self.job.result = result;
                }
                Ok(())
            }
            _ => Err(self.invalid(JobStatus::Failed)),
        }
    }

    /// Transition: * → CANCELLED
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.job.status.is_terminal() {
            return Err(self.invalid(JobStatus::Cancelled));
        }
        self.set_status(JobStatus::Cancelled);
        self.job.completed_at = Some(self.job.updated_at);
        self.job.error_message = Some(reason.into());
        Ok(())
    }

    /// Record the index of the next step to run (running jobs only)
    pub fn advance(&mut self, next_step_index: usize) -> Result<()> {
        match self.job.status {
            JobStatus::Running if next_step_index <= self.job.total_steps => {
                self.job.current_step_index = next_step_index;
                self.job.updated_at = Utc::now();
                Ok(())
            }
            JobStatus::Running => Err(OrchestratorError::config(format!(
                "Step index {} exceeds total steps {}",
                next_step_index, self.job.total_steps
            ))),
            _ => Err(OrchestratorError::InvalidStateTransition {
                from: self.job.status.as_str().to_string(),
                to: "advance".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job() -> JobStateMachine {
        let mut sm = JobStateMachine::new(Job::new("s", serde_json::json!({}), 3));
        sm.begin_validation().unwrap();
        sm.start().unwrap();
        sm
    }

    #[test]
    fn test_pending_to_running() {
        let sm = running_job();
        assert_eq!(sm.job().status, JobStatus::Running);
        assert!(sm.job().started_at.is_some());
    }

    #[test]
    fn test_cannot_start_pending_job() {
        let mut sm = JobStateMachine::new(Job::new("s", serde_json::json!({}), 1));
        let err = sm.start().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidStateTransition { ref from, ref to }
                if from == "pending" && to == "running"
        ));
    }

    #[test]
    fn test_running_to_completed() {
        let mut sm = running_job();
        sm.advance(1).unwrap();
        sm.complete(Some(serde_json::json!({"matched": 2}))).unwrap();

        let job = sm.into_job();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.current_step_index, 3);
        assert!(job.completed_at.is_some());
        assert_eq!(job.result.unwrap()["matched"], 2);
    }

    #[test]
    fn test_pause_and_resume_keeps_started_at() {
        let mut sm = running_job();
        let started = sm.job().started_at;
        sm.pause().unwrap();
        assert_eq!(sm.job().status, JobStatus::Paused);
        assert!(sm.pause().is_err());

        sm.start().unwrap();
        assert_eq!(sm.job().started_at, started);
    }

    #[test]
    fn test_fail_keeps_partial_result() {
        let mut sm = running_job();
        sm.fail(
            "step 'load' failed",
            Some(serde_json::json!({"error_type": "step_execution"})),
            Some(serde_json::json!({"matched": 1})),
        )
        .unwrap();

        let job = sm.job();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("step 'load' failed"));
        assert_eq!(job.result.as_ref().unwrap()["matched"], 1);
    }

    #[test]
    fn test_validation_failure() {
        let mut sm = JobStateMachine::new(Job::new("s", serde_json::json!({}), 1));
        sm.begin_validation().unwrap();
        sm.fail("unknown action", None, None).unwrap();
        assert_eq!(sm.job().status, JobStatus::Failed);
    }

    #[test]
    fn test_cancel_from_paused() {
        let mut sm = running_job();
        sm.pause().unwrap();
        sm.cancel("user requested").unwrap();
        assert_eq!(sm.job().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cannot_cancel_completed_job() {
        let mut sm = running_job();
        sm.complete(None).unwrap();
        assert!(sm.cancel("too late").is_err());
        assert!(sm.fail("too late", None, None).is_err());
    }

    #[test]
    fn test_advance_bounds() {
        let mut sm = running_job();
        sm.advance(3).unwrap();
        assert!(sm.advance(4).is_err());

        sm.pause().unwrap();
        assert!(sm.advance(1).is_err());
    }
}
