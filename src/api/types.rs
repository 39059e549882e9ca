use crate::chunk::{UploadProgress, UploadStatus};
use crate::materializer::MaterializedFile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Success envelope: `{"success": true, ...fields of T}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAcceptedResponse {
    #[serde(flatten)]
    pub progress: UploadProgress,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub upload_status: UploadStatus,
    #[serde(flatten)]
    pub file: MaterializedFile,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub task_id: i64,
    pub progress: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task: crate::task::AnalysisTask,
    /// Children of an aggregate; empty for an engine task
    pub children: Vec<crate::task::AnalysisTask>,
}
