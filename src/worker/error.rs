use crate::dispatch::DispatchError;
use crate::task::TaskError;
use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Task(e) => e.kind(),
            WorkerError::Dispatch(e) => e.kind(),
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
