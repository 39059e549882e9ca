//! Wire messages exchanged with analysis workers.

use crate::dispatch::engine::{EngineParams, EngineType};
use crate::dispatch::error::DispatchResult;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// Version stamped on every message this crate produces.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Work item for one engine, keyed by file id on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub engine_type: EngineType,
    pub task_id: i64,
    pub file_id: String,
    /// URL (or object-store location) of the merged media
    pub media_location: String,
    /// Encoded [`EngineParams`] for `engine_type`
    pub engine_params: serde_json::Value,
}

impl DispatchMessage {
    pub fn new(
        task_id: i64,
        file_id: impl Into<String>,
        media_location: impl Into<String>,
        params: &EngineParams,
    ) -> DispatchResult<Self> {
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            engine_type: params.engine_type(),
            task_id,
            file_id: file_id.into(),
            media_location: media_location.into(),
            engine_params: params.to_value()?,
        })
    }

    /// Decode the parameters against the schema of `engine_type`.
    pub fn params(&self) -> DispatchResult<EngineParams> {
        EngineParams::parse(self.engine_type, Some(&self.engine_params))
    }

    pub fn encode(&self) -> DispatchResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> DispatchResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Completion report for one task.
///
/// `taskId` is kept as received (workers may send a number or a string) and
/// resolved by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(deserialize_with = "task_id_from_any")]
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResultMessage {
    pub fn success(task_id: i64, payload: serde_json::Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.to_string(),
            success: true,
            payload,
        }
    }

    pub fn failure(task_id: i64, error: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.to_string(),
            success: false,
            payload: serde_json::json!({ "error": error.into() }),
        }
    }

    /// Numeric task id, if the raw id is one.
    pub fn numeric_task_id(&self) -> Option<i64> {
        self.task_id.trim().parse().ok()
    }

    /// Human-readable failure reason carried by the payload.
    pub fn error_message(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => match map.get("error") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => self.payload.to_string(),
            },
            serde_json::Value::Null => "engine reported failure".to_string(),
            other => other.to_string(),
        }
    }

    pub fn encode(&self) -> DispatchResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> DispatchResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn task_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Ok(other.to_string()),
    }
}
