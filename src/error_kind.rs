use serde::{Deserialize, Serialize};

/// Failure classes shared by every domain error.
///
/// Callers branch on the class rather than on module-specific variants; the
/// API layer maps each class to one HTTP status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    NotReady,
    Integrity,
    Dispatch,
    UnresolvedResult,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::NotReady => "NOT_READY",
            ErrorKind::Integrity => "INTEGRITY_ERROR",
            ErrorKind::Dispatch => "DISPATCH_ERROR",
            ErrorKind::UnresolvedResult => "UNRESOLVED_RESULT",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether re-issuing the same call may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Dispatch | ErrorKind::NotReady | ErrorKind::Internal)
    }
}
