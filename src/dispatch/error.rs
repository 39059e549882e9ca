use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Publish to {topic}[{partition}] timed out")]
    Timeout { topic: String, partition: usize },

    #[error("Topic {0} is closed")]
    Closed(String),

    #[error("Partition {partition} of {topic} already has a subscriber")]
    AlreadySubscribed { topic: String, partition: usize },

    #[error("Topic {topic} has no partition {partition}")]
    InvalidPartition { topic: String, partition: usize },

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Invalid parameters for {engine}: {reason}")]
    InvalidParams { engine: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Timeout { .. } | DispatchError::Closed(_) => ErrorKind::Dispatch,
            DispatchError::AlreadySubscribed { .. } => ErrorKind::Conflict,
            DispatchError::InvalidPartition { .. }
            | DispatchError::UnknownEngine(_)
            | DispatchError::InvalidParams { .. } => ErrorKind::Validation,
            DispatchError::SerializationError(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::SerializationError(err.to_string())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
