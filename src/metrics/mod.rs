//! Metrics and observability module
//!
//! Prometheus-compatible metrics for the ingest and analysis pipeline:
//! - Chunk uploads (accepted, rejected, completed)
//! - Merges (duration, size, integrity failures)
//! - Dispatch and results (per engine, per outcome)
//! - In-process engine runs

pub mod exporter;
pub mod recorder;

pub use exporter::{install_recorder, render_metrics, MetricsError};
pub use recorder::*;
