//! Aggregate task roll-up from its children.

use crate::task::error::{TaskError, TaskResult};
use crate::task::state_machine::{Actor, TaskEvent, TaskStateMachine};
use crate::task::store::TaskStore;
use crate::task::types::{AnalysisTask, TaskStatus, TaskUpdate};
use serde_json::json;
use tracing::{debug, info};

const MAX_ROLLUP_ATTEMPTS: usize = 5;

/// What an aggregate should look like given its children.
#[derive(Debug, Clone, PartialEq)]
pub enum RollUp {
    /// Children still running; only the mean progress moves
    InProgress { progress: u8 },
    /// Every child is terminal
    Finished {
        status: TaskStatus,
        progress: u8,
        summary: serde_json::Value,
    },
}

/// Compute the aggregate outcome.
///
/// Once all children are terminal: any failure fails the aggregate, all
/// cancelled cancels it, anything else completes it.
pub fn summarize(children: &[AnalysisTask]) -> RollUp {
    let progress = if children.is_empty() {
        0
    } else {
        let total: u32 = children.iter().map(|c| u32::from(c.progress)).sum();
        (total / children.len() as u32) as u8
    };

    if children.is_empty() || children.iter().any(|c| !c.status.is_terminal()) {
        return RollUp::InProgress { progress };
    }

    let count = |status: TaskStatus| children.iter().filter(|c| c.status == status).count();
    let completed = count(TaskStatus::Completed);
    let failed = count(TaskStatus::Failed);
    let cancelled = count(TaskStatus::Cancelled);

    let status = if failed > 0 {
        TaskStatus::Failed
    } else if cancelled == children.len() {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Completed
    };

    let outcomes: Vec<serde_json::Value> = children
        .iter()
        .map(|c| {
            json!({
                "taskId": c.id,
                "engineType": c.engine_type,
                "status": c.status,
                "errorMessage": c.error_message,
            })
        })
        .collect();

    RollUp::Finished {
        status,
        progress,
        summary: json!({
            "completed": completed,
            "failed": failed,
            "cancelled": cancelled,
            "children": outcomes,
        }),
    }
}

impl TaskStore {
    /// Bring an aggregate in line with its children.
    ///
    /// Returns the aggregate as stored afterwards. A terminal aggregate is
    /// left untouched.
    pub async fn roll_up(&self, aggregate_id: i64) -> TaskResult<AnalysisTask> {
        for _ in 0..MAX_ROLLUP_ATTEMPTS {
            let aggregate = self.require(aggregate_id).await?;
            if !aggregate.is_aggregate() {
                return Err(TaskError::InvalidTree(format!(
                    "task {} is not an aggregate",
                    aggregate_id
                )));
            }
            if aggregate.status.is_terminal() {
                return Ok(aggregate);
            }

            let children = self.children(aggregate_id).await?;
            let result = match summarize(&children) {
                RollUp::InProgress { progress } => {
                    self.update_progress(aggregate_id, progress).await?;
                    return self.require(aggregate_id).await;
                }
                RollUp::Finished {
                    status,
                    progress,
                    summary,
                } => self.finish_aggregate(&aggregate, status, progress, summary).await,
            };

            match result {
                Ok(task) => {
                    info!(task_id = aggregate_id, status = %task.status, "Analysis finished");
                    return Ok(task);
                }
                // Another writer moved the aggregate first; re-read and retry
                Err(TaskError::InvalidTransition { .. }) | Err(TaskError::Contended(_)) => {
                    debug!(task_id = aggregate_id, "Aggregate roll-up raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TaskError::Contended(aggregate_id))
    }

    async fn finish_aggregate(
        &self,
        aggregate: &AnalysisTask,
        status: TaskStatus,
        progress: u8,
        summary: serde_json::Value,
    ) -> TaskResult<AnalysisTask> {
        let id = aggregate.id;

        if status == TaskStatus::Cancelled {
            let update = TaskUpdate {
                progress: Some(progress),
                result_payload: Some(summary),
                error_message: None,
            };
            return self.apply(id, TaskEvent::Cancel, Actor::Collector, update).await;
        }

        if let Some(event) = TaskStateMachine::resume_event(aggregate.status) {
            self.apply(id, event, Actor::Collector, TaskUpdate::default())
                .await?;
        }

        let (event, error_message) = match status {
            TaskStatus::Failed => (
                TaskEvent::Fail,
                Some("one or more engines failed".to_string()),
            ),
            _ => (TaskEvent::Complete, None),
        };
        let update = TaskUpdate {
            progress: Some(progress),
            result_payload: Some(summary),
            error_message,
        };
        self.apply(id, event, Actor::Collector, update).await
    }
}
