use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Progress store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid progress value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

impl ProgressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProgressError::Unavailable(_) => ErrorKind::Internal,
            ProgressError::InvalidValue { .. } => ErrorKind::Validation,
        }
    }
}

pub type ProgressResult<T> = Result<T, ProgressError>;
