use crate::materializer::MaterializeError;
use crate::storage::StorageError;
use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Invalid chunk: {0}")]
    Validation(String),

    #[error("Chunk {chunk_index} hash mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        chunk_index: u32,
        expected: String,
        actual: String,
    },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload conflict: {0}")]
    Conflict(String),

    #[error("Merge failed: {0}")]
    Materialize(Box<MaterializeError>),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl ChunkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChunkError::Validation(_) | ChunkError::ChecksumMismatch { .. } => {
                ErrorKind::Validation
            }
            ChunkError::NotFound(_) => ErrorKind::NotFound,
            ChunkError::Conflict(_) => ErrorKind::Conflict,
            ChunkError::Materialize(e) => e.kind(),
            ChunkError::Storage(_) | ChunkError::DatabaseError(_) => ErrorKind::Internal,
        }
    }
}

impl From<MaterializeError> for ChunkError {
    fn from(err: MaterializeError) -> Self {
        ChunkError::Materialize(Box::new(err))
    }
}

impl From<sqlx::Error> for ChunkError {
    fn from(err: sqlx::Error) -> Self {
        ChunkError::DatabaseError(err.to_string())
    }
}

pub type ChunkResult<T> = Result<T, ChunkError>;
