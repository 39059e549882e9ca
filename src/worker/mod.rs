//! In-process worker pool and the engines it can run.
//!
//! Engines are opaque functions of the merged media and their parameters.
//! Out-of-process engines consume their topics elsewhere and only talk back
//! through the results topic.

mod engine;
mod error;
mod metadata;
mod pool;

pub use engine::{Engine, EngineInput, ProgressReporter};
pub use error::{WorkerError, WorkerResult};
pub use metadata::MetadataEngine;
pub use pool::{JobOutcome, WorkerPool};
