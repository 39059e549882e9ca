use crate::chunk::MediaType;
use crate::dispatch::EngineType;
use serde::{Deserialize, Serialize};

/// One engine picked by the user, with optional parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSelection {
    pub engine: EngineType,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl EngineSelection {
    pub fn new(engine: EngineType) -> Self {
        Self {
            engine,
            params: None,
        }
    }

    pub fn with_params(engine: EngineType, params: serde_json::Value) -> Self {
        Self {
            engine,
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisRequest {
    pub file_id: String,
    #[serde(default)]
    pub case_ref: Option<String>,
    pub engines: Vec<EngineSelection>,
}

impl StartAnalysisRequest {
    pub fn new(file_id: impl Into<String>, engines: Vec<EngineSelection>) -> Self {
        Self {
            file_id: file_id.into(),
            case_ref: None,
            engines,
        }
    }
}

/// What happened to one selected engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    /// Message accepted by the queue
    Dispatched { partition: usize, offset: u64 },
    /// Engine not applicable to the file's media type; no task created
    Skipped { reason: String },
    /// Task persisted but the publish failed; it stays QUEUED
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub engine_type: EngineType,
    pub task_id: Option<i64>,
    pub topic: Option<String>,
    #[serde(flatten)]
    pub status: DispatchStatus,
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self.status, DispatchStatus::Dispatched { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisResponse {
    pub aggregate_task_id: i64,
    pub file_id: String,
    pub media_type: MediaType,
    pub dispatched: Vec<DispatchOutcome>,
}

impl StartAnalysisResponse {
    pub fn outcome(&self, engine: EngineType) -> Option<&DispatchOutcome> {
        self.dispatched.iter().find(|o| o.engine_type == engine)
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.iter().filter(|o| o.is_dispatched()).count()
    }
}
