//! File Materializer: merges verified chunks into one published object.

pub mod error;
pub mod materializer;
pub mod types;

pub use error::{MaterializeError, MaterializeResult};
pub use materializer::FileMaterializer;
pub use types::{ChunkRetention, MaterializedFile};
