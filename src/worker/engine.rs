use crate::chunk::MediaFile;
use crate::dispatch::{DispatchMessage, EngineParams, EngineType};
use crate::progress::{ProgressAggregator, ProgressUpdate};
use crate::task::{TaskStatus, TaskStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Everything an engine gets for one task.
pub struct EngineInput {
    pub message: DispatchMessage,
    pub params: EngineParams,
    pub file: MediaFile,
    pub media: Bytes,
}

/// An analysis engine run inside this process.
///
/// `Err` carries the failure reason reported back as the task error.
#[async_trait]
pub trait Engine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    async fn run(
        &self,
        input: &EngineInput,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, String>;
}

/// Progress sink handed to a running engine.
///
/// Writes go to the progress store and to the task record; failures are
/// logged and never abort the engine.
pub struct ProgressReporter {
    task_id: i64,
    aggregator: ProgressAggregator,
    tasks: Arc<TaskStore>,
}

impl ProgressReporter {
    pub fn new(task_id: i64, aggregator: ProgressAggregator, tasks: Arc<TaskStore>) -> Self {
        Self {
            task_id,
            aggregator,
            tasks,
        }
    }

    pub async fn report(&self, stage: &str, percent: f64, message: Option<&str>) {
        let mut update = ProgressUpdate::new(stage, percent);
        if let Some(message) = message {
            update = update.with_message(message);
        }
        if let Err(e) = self.aggregator.report(self.task_id, update).await {
            warn!(task_id = self.task_id, error = %e, "Progress report failed");
        }

        let stored = percent.clamp(0.0, 100.0) as u8;
        if let Err(e) = self.tasks.update_progress(self.task_id, stored).await {
            warn!(task_id = self.task_id, error = %e, "Task progress update failed");
        }
    }

    /// Whether the task was cancelled since the engine started. Engines
    /// may check this between stages and stop early.
    pub async fn is_cancelled(&self) -> bool {
        matches!(
            self.tasks.get(self.task_id).await,
            Ok(Some(task)) if task.status == TaskStatus::Cancelled
        )
    }
}
