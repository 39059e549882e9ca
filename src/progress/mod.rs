//! Progress Aggregator: per-task field maps written by workers and polled by
//! clients.
//!
//! The backing [`ProgressStore`] is an external key/value service contract
//! (hash-per-key with TTL); [`MemoryProgressStore`] implements it in-process.

pub mod aggregator;
pub mod error;
pub mod store;

pub use aggregator::{progress_key, ProgressAggregator, ProgressUpdate};
pub use error::{ProgressError, ProgressResult};
pub use store::{MemoryProgressStore, ProgressStore};
