use crate::task::state_machine::{Actor, TaskEvent};
use crate::task::types::TaskStatus;
use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(i64),

    #[error("Task {task_id} cannot handle {event:?} in status {from}")]
    InvalidTransition {
        task_id: i64,
        from: TaskStatus,
        event: TaskEvent,
    },

    #[error("{actor:?} is not allowed to apply {event:?}")]
    Unauthorized { actor: Actor, event: TaskEvent },

    #[error("Task {0} was modified concurrently")]
    Contended(i64),

    #[error("Invalid task tree: {0}")]
    InvalidTree(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NotFound(_) => ErrorKind::NotFound,
            TaskError::InvalidTransition { .. }
            | TaskError::Unauthorized { .. }
            | TaskError::Contended(_) => ErrorKind::Conflict,
            TaskError::InvalidTree(_) => ErrorKind::Validation,
            TaskError::DatabaseError(_) | TaskError::SerializationError(_) => ErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::SerializationError(err.to_string())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
