//! Result Collector: finalizes task records from engine result messages.

mod collector;

pub use collector::{ApplyOutcome, ResultCollector};
