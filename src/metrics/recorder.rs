//! Metric names and recording helpers for uploads, merges and analysis.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // Upload counters
    describe_counter!(
        "mediatrace_chunks_accepted_total",
        "Chunks accepted and verified"
    );
    describe_counter!(
        "mediatrace_chunk_bytes_total",
        "Bytes received in accepted chunks"
    );
    describe_counter!(
        "mediatrace_chunks_rejected_total",
        "Chunks rejected, labelled by reason"
    );
    describe_counter!(
        "mediatrace_uploads_completed_total",
        "Uploads whose last chunk arrived"
    );

    // Merge
    describe_counter!("mediatrace_merges_total", "Files merged and published");
    describe_counter!(
        "mediatrace_integrity_failures_total",
        "Whole-file or chunk integrity failures found while merging"
    );
    describe_histogram!(
        "mediatrace_merge_duration_seconds",
        "Time to merge and publish one file"
    );
    describe_histogram!("mediatrace_merged_file_bytes", "Size of merged files");

    // Dispatch
    describe_counter!(
        "mediatrace_tasks_dispatched_total",
        "Dispatch messages published, by engine"
    );
    describe_counter!(
        "mediatrace_tasks_skipped_total",
        "Selected engines skipped for the file's media type"
    );
    describe_counter!(
        "mediatrace_dispatch_failures_total",
        "Dispatch publishes that failed, by engine"
    );

    // Results
    describe_counter!(
        "mediatrace_results_total",
        "Result messages handled, by outcome"
    );
    describe_counter!(
        "mediatrace_results_dropped_total",
        "Result messages dropped without a task, by reason"
    );

    // In-process engines
    describe_gauge!(
        "mediatrace_engine_runs_in_flight",
        "In-process engine runs currently executing"
    );
    describe_histogram!(
        "mediatrace_engine_run_duration_seconds",
        "In-process engine run time"
    );
    describe_counter!(
        "mediatrace_engine_runs_total",
        "In-process engine runs, by engine and outcome"
    );
}

// ============== Uploads ==============

pub fn record_chunk_accepted(chunk_size: usize) {
    counter!("mediatrace_chunks_accepted_total").increment(1);
    counter!("mediatrace_chunk_bytes_total").increment(chunk_size as u64);
}

pub fn record_chunk_rejected(reason: &str) {
    counter!("mediatrace_chunks_rejected_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_upload_completed() {
    counter!("mediatrace_uploads_completed_total").increment(1);
}

// ============== Merge ==============

pub fn record_merge_completed(file_size: u64, duration: Duration) {
    counter!("mediatrace_merges_total").increment(1);
    histogram!("mediatrace_merge_duration_seconds").record(duration.as_secs_f64());
    histogram!("mediatrace_merged_file_bytes").record(file_size as f64);
}

/// `scope` is "chunk" or "file"
pub fn record_integrity_failure(scope: &str) {
    counter!("mediatrace_integrity_failures_total", "scope" => scope.to_string()).increment(1);
}

// ============== Dispatch ==============

pub fn record_task_dispatched(engine: &str) {
    counter!("mediatrace_tasks_dispatched_total", "engine" => engine.to_string()).increment(1);
}

pub fn record_task_skipped(engine: &str) {
    counter!("mediatrace_tasks_skipped_total", "engine" => engine.to_string()).increment(1);
}

pub fn record_task_dispatch_failed(engine: &str) {
    counter!("mediatrace_dispatch_failures_total", "engine" => engine.to_string()).increment(1);
}

// ============== Results ==============

pub fn record_result_applied(outcome: &str) {
    counter!("mediatrace_results_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_result_dropped(reason: &str) {
    counter!("mediatrace_results_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============== Engines ==============

pub fn record_engine_run(engine: &str, duration: Duration, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "mediatrace_engine_runs_total",
        "engine" => engine.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("mediatrace_engine_run_duration_seconds", "engine" => engine.to_string())
        .record(duration.as_secs_f64());
}

/// Tracks one in-process engine run; keeps the in-flight gauge balanced.
pub struct EngineRunTimer {
    engine: &'static str,
    start_time: Instant,
}

impl EngineRunTimer {
    pub fn start(engine: &'static str) -> Self {
        gauge!("mediatrace_engine_runs_in_flight").increment(1.0);
        Self {
            engine,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Stop timing and record the run
    pub fn finish(self, success: bool) {
        gauge!("mediatrace_engine_runs_in_flight").decrement(1.0);
        record_engine_run(self.engine, self.start_time.elapsed(), success);
    }
}
