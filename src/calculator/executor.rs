//! Task executors
//!
//! A [`TaskExecutor`] runs one [`CurveTask`] to completion. The controller
//! only sees the returned `Result`, so executors backed by remote workers
//! can be plugged in without touching the fold.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::compute::{compute_curves, CurveTask, PartialResult, TaskParams};
use crate::error::{HazardError, Result};

/// Runs curve tasks
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute a task. Must be safe to call again with the same task.
    async fn execute(&self, task: Arc<CurveTask>, params: Arc<TaskParams>) -> Result<PartialResult>;

    /// Executor name for logging
    fn name(&self) -> &str;
}

/// Runs tasks on the tokio blocking pool of the current process
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a local executor
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for LocalExecutor {
    async fn execute(&self, task: Arc<CurveTask>, params: Arc<TaskParams>) -> Result<PartialResult> {
        let task_no = task.task_no;
        let handle = tokio::task::spawn_blocking(move || compute_curves(&task, &params));
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                debug!(task_no, "Curve task panicked");
                Err(HazardError::worker(format!("task #{} panicked", task_no)))
            }
            Err(e) => Err(HazardError::worker(format!("task #{} was cancelled: {}", task_no, e))),
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}
