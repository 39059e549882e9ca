use crate::dispatch::EngineType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "PAUSED" => Ok(TaskStatus::Paused),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    pub id: i64,
    pub file_id: String,
    /// `None` for the aggregate task of an analysis run
    pub engine_type: Option<EngineType>,
    pub status: TaskStatus,
    pub parent_task_id: Option<i64>,
    pub case_ref: Option<String>,
    pub progress: u8,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl AnalysisTask {
    pub fn is_aggregate(&self) -> bool {
        self.parent_task_id.is_none() && self.engine_type.is_none()
    }
}

/// An aggregate task and its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTree {
    pub aggregate: AnalysisTask,
    pub children: Vec<AnalysisTask>,
}

impl TaskTree {
    pub fn child(&self, engine_type: EngineType) -> Option<&AnalysisTask> {
        self.children
            .iter()
            .find(|c| c.engine_type == Some(engine_type))
    }
}

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub progress: Option<u8>,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn with_result(payload: serde_json::Value) -> Self {
        Self {
            result_payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_error(message: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            error_message: Some(message.into()),
            result_payload: payload,
            ..Default::default()
        }
    }
}
