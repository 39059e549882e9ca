//! Task Orchestrator: turns a materialized file and an engine selection
//! into persisted tasks and dispatch messages.

mod error;
mod orchestrator;
mod types;

pub use error::{CoordinatorError, CoordinatorResult};
pub use orchestrator::TaskOrchestrator;
pub use types::{
    DispatchOutcome, DispatchStatus, EngineSelection, StartAnalysisRequest, StartAnalysisResponse,
};
