//! Chunk Registry: durable record of received chunks and upload completeness.

pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{ChunkError, ChunkResult};
pub use registry::ChunkRegistry;
pub use store::UploadStore;
pub use types::{
    ChunkRecord, ChunkStatus, ChunkUpload, MediaFile, MediaType, UploadProgress, UploadStatus,
};
