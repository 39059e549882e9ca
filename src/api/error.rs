use crate::chunk::ChunkError;
use crate::coordinator::CoordinatorError;
use crate::ErrorKind;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Upload(#[from] ChunkError),

    #[error("{0}")]
    Analysis(#[from] CoordinatorError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Upload(e) => e.kind(),
            ApiError::Analysis(e) => e.kind(),
            ApiError::InvalidRequest(_) => ErrorKind::Validation,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::NotReady => StatusCode::CONFLICT,
        ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Dispatch => StatusCode::BAD_GATEWAY,
        ErrorKind::UnresolvedResult | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self, code = kind.code(), "Request failed");
        }

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "code": kind.code(),
            "retryable": kind.is_retryable(),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
