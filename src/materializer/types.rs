use crate::chunk::MediaType;
use serde::{Deserialize, Serialize};

/// What happens to staged chunk blobs once the merged object is published.
///
/// Chunk records are always kept (as MERGED) so progress queries keep
/// answering for completed uploads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRetention {
    #[default]
    DeleteBlobs,
    Keep,
}

/// A published, verified object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedFile {
    pub file_id: String,
    pub file_name: String,
    pub storage_key: String,
    pub content_hash: String,
    pub size: u64,
    pub media_type: MediaType,
}
