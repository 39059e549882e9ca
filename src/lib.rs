//! Chunked media ingest and forensic analysis orchestration.
//!
//! Uploads arrive as resumable chunks through the [`chunk`] registry, are
//! merged into a single verified object by the [`materializer`], and are then
//! fanned out to analysis engines by the [`coordinator`]. Engines report
//! progress into the [`progress`] aggregator and completion through the
//! results topic drained by the [`collector`].

pub mod api;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod integrity;
pub mod materializer;
pub mod metrics;
pub mod progress;
pub mod storage;
pub mod task;
pub mod worker;

mod error_kind;

pub use error_kind::ErrorKind;
