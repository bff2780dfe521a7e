//! Bounded-concurrency sub-batch runner
//!
//! A step that fans out (e.g. identifier chunks sent to an external resolver)
//! goes through a `BatchRunner`: at most `max_concurrent` sub-batches are in
//! flight, each attempt has a timeout, transient failures are retried with a
//! fixed backoff, and a sub-batch that exhausts its attempts fails alone.
//! Cancellation stops new sub-batches from starting; in-flight ones finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct FailedBatch<T> {
    pub batch_index: usize,
    pub items: Vec<T>,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BatchReport<T, R> {
    /// (batch index, output) in batch order
    pub succeeded: Vec<(usize, R)>,
    pub failed: Vec<FailedBatch<T>>,
    /// Batches never started because the job was cancelled
    pub skipped: Vec<(usize, Vec<T>)>,
    /// Attempts beyond the first, summed over all batches
    pub retries: u32,
}

impl<T, R> Default for BatchReport<T, R> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            retries: 0,
        }
    }
}

impl<T, R> BatchReport<T, R> {
    pub fn total_batches(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

enum Outcome<T, R> {
    Succeeded(R, u32),
    Failed(FailedBatch<T>),
    Skipped(Vec<T>),
}

#[derive(Clone)]
pub struct BatchRunner {
    semaphore: Arc<Semaphore>,
    max_attempts: u32,
    backoff: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(config: &BatchConfig, cancel: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            cancel,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Split `items` into chunks of `chunk_size` and run `f` on each
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, chunk_size: usize, f: F) -> BatchReport<T, R>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let chunk_size = chunk_size.max(1);
        let batches: Vec<Vec<T>> = items.chunks(chunk_size).map(<[T]>::to_vec).collect();
        let total = batches.len();
        debug!("Running {} sub-batches (chunk size {})", total, chunk_size);

        let f = &f;
        let outcomes = join_all(
            batches
                .into_iter()
                .enumerate()
                .map(|(index, batch)| self.run_one(index, batch, f)),
        )
        .await;

        let mut report = BatchReport::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Outcome::Succeeded(output, attempts) => {
                    report.retries += attempts - 1;
                    report.succeeded.push((index, output));
                }
                Outcome::Failed(failed) => {
                    report.retries += failed.attempts.saturating_sub(1);
                    report.failed.push(failed);
                }
                Outcome::Skipped(batch) => report.skipped.push((index, batch)),
            }
        }

        if !report.failed.is_empty() || !report.skipped.is_empty() {
            warn!(
                "Sub-batches: {} succeeded, {} failed, {} skipped (of {})",
                report.succeeded.len(),
                report.failed.len(),
                report.skipped.len(),
                total
            );
        } else {
            info!("Sub-batches: all {} succeeded", total);
        }
        report
    }

    async fn run_one<T, R, F, Fut>(&self, index: usize, batch: Vec<T>, f: &F) -> Outcome<T, R>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.cancel.is_cancelled() {
            return Outcome::Skipped(batch);
        }
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Outcome::Skipped(batch);
        };
        // Cancellation may have arrived while waiting for a slot
        if self.cancel.is_cancelled() {
            return Outcome::Skipped(batch);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let error = match tokio::time::timeout(self.timeout, f(batch.clone())).await {
                Ok(Ok(output)) => return Outcome::Succeeded(output, attempt),
                Ok(Err(e)) => e,
                Err(_) => OrchestratorError::Timeout(format!(
                    "sub-batch {} exceeded {:?}",
                    index, self.timeout
                )),
            };
            last_error = error.to_string();

            if !error.category().is_retryable() {
                warn!("Sub-batch {} failed permanently: {}", index, error);
                return Outcome::Failed(FailedBatch {
                    batch_index: index,
                    items: batch,
                    error: last_error,
                    attempts: attempt,
                });
            }
            if attempt < self.max_attempts {
                if self.cancel.is_cancelled() {
                    return Outcome::Failed(FailedBatch {
                        batch_index: index,
                        items: batch,
                        error: format!("{} (retry abandoned: cancelled)", last_error),
                        attempts: attempt,
                    });
                }
                warn!(
                    "Sub-batch {} attempt {}/{} failed, retrying in {:?}: {}",
                    index, attempt, self.max_attempts, self.backoff, error
                );
                tokio::time::sleep(self.backoff).await;
            }
        }

        warn!(
            "Sub-batch {} exhausted {} attempts: {}",
            index, self.max_attempts, last_error
        );
        Outcome::Failed(FailedBatch {
            batch_index: index,
            items: batch,
            error: last_error,
            attempts: self.max_attempts,
        })
    }
}
