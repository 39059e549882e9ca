use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::chunk::{ChunkRegistry, ChunkUpload, UploadProgress};
use crate::coordinator::{StartAnalysisRequest, StartAnalysisResponse, TaskOrchestrator};
use crate::metrics;
use crate::storage::ObjectStore;
use crate::task::TaskTree;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChunkRegistry>,
    pub orchestrator: TaskOrchestrator,
    pub objects: Arc<dyn ObjectStore>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        // Uploads
        .route("/api/v1/upload/chunk", post(upload_chunk))
        .route("/api/v1/upload/:file_id/progress", get(upload_progress))
        .route("/api/v1/upload/:file_id/pause", post(pause_upload))
        .route("/api/v1/upload/:file_id/resume", post(resume_upload))
        .route("/api/v1/upload/:file_id/cancel", post(cancel_upload))
        .route("/api/v1/upload/:file_id/retry", post(retry_upload))
        .route("/api/v1/upload/:file_id/restart", post(restart_upload))
        .route("/api/v1/upload/:file_id/merge", post(merge_upload))
        // Analysis
        .route("/api/v1/analysis/start", post(start_analysis))
        .route("/api/v1/analysis/progress/:task_id", get(analysis_progress))
        .route("/api/v1/analysis/tasks/:task_id", get(get_task))
        .route("/api/v1/analysis/tasks/:task_id/cancel", post(cancel_task))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn render_metrics() -> Response {
    match metrics::render_metrics() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized").into_response(),
    }
}

#[derive(Default)]
struct ChunkForm {
    file_id: Option<String>,
    file_name: Option<String>,
    chunk_index: Option<u32>,
    total_chunks: Option<u32>,
    total_size: Option<u64>,
    chunk_hash: Option<String>,
    data: Option<Bytes>,
}

impl ChunkForm {
    fn into_upload(self) -> ApiResult<ChunkUpload> {
        fn required<T>(value: Option<T>, name: &str) -> ApiResult<T> {
            value.ok_or_else(|| ApiError::InvalidRequest(format!("missing field {name}")))
        }

        Ok(ChunkUpload {
            file_id: required(self.file_id, "fileId")?,
            file_name: required(self.file_name, "fileName")?,
            chunk_index: required(self.chunk_index, "chunkIndex")?,
            total_chunks: required(self.total_chunks, "totalChunks")?,
            total_size: required(self.total_size, "totalSize")?,
            chunk_hash: self.chunk_hash.filter(|h| !h.trim().is_empty()),
            data: required(self.data, "file")?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, text: &str) -> ApiResult<T> {
    text.trim()
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("{name} must be a non-negative integer")))
}

async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Success<ChunkAcceptedResponse>>> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();

        if name == "file" {
            if form.file_name.is_none() {
                form.file_name = field.file_name().map(str::to_string);
            }
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidRequest(format!("Failed to read chunk data: {e}")))?;
            form.data = Some(data);
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to read field {name}: {e}")))?;

        match name.as_str() {
            "fileId" => form.file_id = Some(text),
            "fileName" => form.file_name = Some(text),
            "chunkIndex" => form.chunk_index = Some(parse_number(&name, &text)?),
            "totalChunks" => form.total_chunks = Some(parse_number(&name, &text)?),
            "totalSize" => form.total_size = Some(parse_number(&name, &text)?),
            "chunkHash" => form.chunk_hash = Some(text),
            _ => {}
        }
    }

    let upload = form.into_upload()?;
    let chunk_index = upload.chunk_index;
    let progress = state.registry.accept_chunk(upload).await?;

    Ok(Json(Success::new(ChunkAcceptedResponse {
        progress,
        chunk_index,
    })))
}

type UploadResponse = ApiResult<Json<Success<UploadProgress>>>;

async fn upload_progress(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.get_upload_progress(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn pause_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.pause_upload(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn resume_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.resume_upload(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn cancel_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.cancel_upload(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn retry_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.retry_failed_chunks(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn restart_upload(State(state): State<AppState>, Path(file_id): Path<String>) -> UploadResponse {
    let progress = state.registry.restart_upload(&file_id).await?;
    Ok(Json(Success::new(progress)))
}

async fn merge_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<Success<MergeResponse>>> {
    let file = state.registry.retry_merge(&file_id).await?;
    let record = state.registry.get_file(&file_id).await?;
    let location = state.objects.url_for(&file.storage_key);

    Ok(Json(Success::new(MergeResponse {
        upload_status: record.upload_status,
        file,
        location,
    })))
}

async fn start_analysis(
    State(state): State<AppState>,
    Json(request): Json<StartAnalysisRequest>,
) -> ApiResult<(StatusCode, Json<Success<StartAnalysisResponse>>)> {
    let response = state.orchestrator.start_analysis(request).await?;
    Ok((StatusCode::CREATED, Json(Success::new(response))))
}

async fn analysis_progress(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<Success<ProgressResponse>>> {
    let progress = state.orchestrator.get_progress(task_id).await?;
    Ok(Json(Success::new(ProgressResponse { task_id, progress })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<Success<TaskResponse>>> {
    let task = state.orchestrator.get_task(task_id).await?;
    let children = if task.is_aggregate() {
        state.orchestrator.get_task_tree(task_id).await?.children
    } else {
        Vec::new()
    };
    Ok(Json(Success::new(TaskResponse { task, children })))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<Success<TaskTree>>> {
    let tree = state.orchestrator.cancel_task(task_id).await?;
    Ok(Json(Success::new(tree)))
}
