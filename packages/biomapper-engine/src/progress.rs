//! Per-job progress state and subscriber fan-out
//!
//! Callbacks run synchronously, in subscription order, on the thread that
//! reported the update. The subscriber list is copied out of its lock before
//! any callback runs, so a callback may subscribe or unsubscribe freely. A
//! failing or panicking callback is logged and skipped.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use biomapper_storage::JobStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Progress,
    Complete,
    Error,
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Serializable view of a tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub current_step_index: usize,
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    pub percentage: f64,
    /// Most recent first
    pub messages: Vec<String>,
    pub elapsed_ms: u64,
    pub status: JobStatus,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ProgressState {
    current_step_index: usize,
    current_step_name: Option<String>,
    total_steps: usize,
    percentage: f64,
    messages: VecDeque<String>,
    status: JobStatus,
}

pub struct ProgressTracker {
    job_id: Uuid,
    max_messages: usize,
    started: Instant,
    state: Mutex<ProgressState>,
    subscribers: Mutex<Vec<(SubscriptionId, ProgressCallback)>>,
    next_id: AtomicU64,
}

impl ProgressTracker {
    pub fn new(job_id: Uuid, total_steps: usize, max_messages: usize) -> Self {
        Self {
            job_id,
            max_messages: max_messages.max(1),
            started: Instant::now(),
            state: Mutex::new(ProgressState {
                current_step_index: 0,
                current_step_name: None,
                total_steps,
                percentage: 0.0,
                messages: VecDeque::new(),
                status: JobStatus::Pending,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn subscribe(&self, callback: ProgressCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, callback));
        id
    }

    /// Returns false if the subscription was not found
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Bridge events into an unbounded channel (for SSE/websocket transports)
    ///
    /// The subscription drops itself once the receiver is gone.
    pub fn subscribe_channel(self: &Arc<Self>) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot = id_slot.clone();

        let id = self.subscribe(Arc::new(move |event: &ProgressEvent| {
            if tx.send(event.clone()).is_err() {
                if let (Some(tracker), Some(id)) = (weak.upgrade(), *slot.lock()) {
                    tracker.unsubscribe(id);
                }
                anyhow::bail!("progress receiver closed");
            }
            Ok(())
        }));
        *id_slot.lock() = Some(id);
        rx
    }

    /// Set the step about to run and the status
    pub fn step_started(&self, step_index: usize, step_name: &str) {
        self.update(|state| {
            state.current_step_index = step_index;
            state.current_step_name = Some(step_name.to_string());
            state.status = JobStatus::Running;
            state.percentage = percentage(step_index, state.total_steps);
            format!("Step {} '{}' started", step_index + 1, step_name)
        });
    }

    /// Mark `step_index` done
    pub fn step_finished(&self, step_index: usize, step_name: &str, message: &str) {
        self.update(|state| {
            state.current_step_index = step_index + 1;
            state.percentage = percentage(step_index + 1, state.total_steps);
            if message.is_empty() {
                format!("Step {} '{}' finished", step_index + 1, step_name)
            } else {
                format!("Step {} '{}': {}", step_index + 1, step_name, message)
            }
        });
    }

    /// Free-form progress message (sub-batch completion etc.)
    pub fn message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(move |_| message);
    }

    /// Status change without step movement (paused, resumed)
    pub fn set_status(&self, status: JobStatus, message: impl Into<String>) {
        let message = message.into();
        self.update(move |state| {
            state.status = status;
            message
        });
    }

    /// Terminal success
    pub fn complete(&self, payload: Value) {
        {
            let mut state = self.state.lock();
            state.status = JobStatus::Completed;
            state.percentage = 100.0;
            state.current_step_index = state.total_steps;
            push_message(&mut state.messages, self.max_messages, "Job completed".into());
        }
        self.notify(ProgressEventType::Complete, payload);
    }

    /// Terminal failure or cancellation
    pub fn error(&self, status: JobStatus, message: &str) {
        {
            let mut state = self.state.lock();
            state.status = status;
            push_message(&mut state.messages, self.max_messages, message.to_string());
        }
        let mut payload = self.snapshot_value();
        payload["error"] = Value::String(message.to_string());
        self.notify(ProgressEventType::Error, payload);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            job_id: self.job_id,
            current_step_index: state.current_step_index,
            current_step_name: state.current_step_name.clone(),
            total_steps: state.total_steps,
            percentage: state.percentage,
            messages: state.messages.iter().cloned().collect(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            status: state.status,
        }
    }

    fn snapshot_value(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState) -> String) {
        {
            let mut state = self.state.lock();
            let message = f(&mut *state);
            push_message(&mut state.messages, self.max_messages, message);
        }
        let payload = self.snapshot_value();
        self.notify(ProgressEventType::Progress, payload);
    }

    fn notify(&self, event_type: ProgressEventType, payload: Value) {
        let subscribers: Vec<(SubscriptionId, ProgressCallback)> =
            self.subscribers.lock().iter().cloned().collect();
        if subscribers.is_empty() {
            return;
        }

        let event = ProgressEvent {
            event_type,
            timestamp: Utc::now(),
            payload,
        };
        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Progress subscriber {:?} of job {} failed: {}",
                    id, self.job_id, e
                ),
                Err(_) => warn!(
                    "Progress subscriber {:?} of job {} panicked",
                    id, self.job_id
                ),
            }
        }
    }
}

fn percentage(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done.min(total) as f64 / total as f64) * 100.0
}

/// Most recent first; oldest messages fall off the end
fn push_message(messages: &mut VecDeque<String>, max: usize, message: String) {
    messages.push_front(message);
    messages.truncate(max);
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("job_id", &self.job_id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
