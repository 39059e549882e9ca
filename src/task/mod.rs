//! Analysis tasks: entity, transition table and durable store.
//!
//! Tasks form a two-level tree. An aggregate task (no engine, no parent)
//! owns nothing; each child holds the aggregate's id and is looked up by it.

pub mod error;
pub mod rollup;
pub mod state_machine;
pub mod store;
pub mod types;

pub use error::{TaskError, TaskResult};
pub use rollup::{summarize, RollUp};
pub use state_machine::{Actor, TaskEvent, TaskStateMachine};
pub use store::TaskStore;
pub use types::{AnalysisTask, TaskStatus, TaskTree, TaskUpdate};
