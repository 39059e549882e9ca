use crate::chunk::ChunkError;
use crate::integrity::IntegrityError;
use crate::storage::StorageError;
use crate::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload {file_id} is not ready to merge: {reason}")]
    NotReady { file_id: String, reason: String },

    /// The merged bytes do not match what the client declared; the upload
    /// has been marked FAILED.
    #[error("Integrity check failed for {file_id}: {source}")]
    Integrity {
        file_id: String,
        source: IntegrityError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload store error: {0}")]
    Store(#[from] ChunkError),
}

impl MaterializeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MaterializeError::NotFound(_) => ErrorKind::NotFound,
            MaterializeError::NotReady { .. } => ErrorKind::NotReady,
            MaterializeError::Integrity { .. } => ErrorKind::Integrity,
            MaterializeError::Storage(_) => ErrorKind::Internal,
            MaterializeError::Store(e) => e.kind(),
        }
    }
}

pub type MaterializeResult<T> = Result<T, MaterializeError>;
