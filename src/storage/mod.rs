//! Durable object storage for staged chunks and merged media.
//!
//! Objects are addressed by slash-separated keys inside one bucket. Large
//! objects are written through an [`ObjectWriter`], which only becomes
//! visible under its key once committed.

pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{chunk_key, object_key, ObjectStore, ObjectWriter};
pub use error::{StorageError, StorageResult};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
