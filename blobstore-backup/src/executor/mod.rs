//! Bounded parallel executor for copy operations.
//!
//! Operations inside a batch run concurrently, at most `max_in_flight` at a
//! time. Batches run one after another. Every failure is collected; nothing
//! stops early.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::utils::{BackupError, Result};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 200;

/// A zero-argument unit of work, typically a single blob copy.
pub type Operation = BoxFuture<'static, Result<()>>;

/// Boxes a future into an [`Operation`].
pub fn operation<F>(future: F) -> Operation
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::pin(future)
}

#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    max_in_flight: usize,
    deadline: Option<Duration>,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl ParallelExecutor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            deadline: None,
        }
    }

    /// Bounds the whole `run` call. Operations still running when it expires
    /// are aborted and their individual results are discarded.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Runs `batches` in order and returns every error produced.
    pub async fn run(&self, batches: Vec<Vec<Operation>>) -> Vec<BackupError> {
        match self.deadline {
            None => self.run_batches(batches).await,
            Some(deadline) => match tokio::time::timeout(deadline, self.run_batches(batches)).await {
                Ok(errors) => errors,
                Err(_) => {
                    warn!("Executor deadline of {:?} expired, abandoning outstanding operations", deadline);
                    vec![BackupError::DeadlineExceeded(deadline)]
                }
            },
        }
    }

    /// Convenience wrapper for a single batch.
    pub async fn run_batch(&self, batch: Vec<Operation>) -> Vec<BackupError> {
        self.run(vec![batch]).await
    }

    async fn run_batches(&self, batches: Vec<Vec<Operation>>) -> Vec<BackupError> {
        let mut errors = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            debug!("Running batch {} with {} operations", index, batch.len());
            errors.extend(self.run_one(batch).await);
        }

        errors
    }

    async fn run_one(&self, batch: Vec<Operation>) -> Vec<BackupError> {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        // Dropping the set (e.g. on deadline) aborts whatever is still running.
        let mut tasks = JoinSet::new();

        for op in batch {
            let sem = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| BackupError::Task(format!("semaphore closed: {}", e)))?;
                op.await
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Operation failed: {}", e);
                    errors.push(e);
                }
                Err(e) => {
                    warn!("Operation task did not complete: {}", e);
                    errors.push(BackupError::Task(e.to_string()));
                }
            }
        }

        errors
    }
}
