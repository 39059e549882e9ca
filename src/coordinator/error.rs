use crate::chunk::{ChunkError, UploadStatus};
use crate::dispatch::DispatchError;
use crate::progress::ProgressError;
use crate::task::TaskError;
use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid analysis request: {0}")]
    Validation(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File {file_id} is not ready for analysis ({status})")]
    NotReady {
        file_id: String,
        status: UploadStatus,
    },

    #[error("Upload error: {0}")]
    Upload(#[from] ChunkError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Validation(_) => ErrorKind::Validation,
            CoordinatorError::FileNotFound(_) => ErrorKind::NotFound,
            CoordinatorError::NotReady { .. } => ErrorKind::NotReady,
            CoordinatorError::Upload(e) => e.kind(),
            CoordinatorError::Task(e) => e.kind(),
            CoordinatorError::Dispatch(e) => e.kind(),
            CoordinatorError::Progress(e) => e.kind(),
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
