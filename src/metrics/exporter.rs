//! Prometheus exporter
//!
//! Installs the global recorder; the text exposition is served by the API
//! router on `GET /metrics`.

use crate::metrics::recorder::init_metrics;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Global prometheus handle
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Held while installing the recorder
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Errors that can occur during metrics setup
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to setup metrics: {0}")]
    SetupFailed(String),
}

/// Install the Prometheus recorder.
///
/// Can only install once per process; later calls return the existing
/// handle.
pub fn install_recorder() -> Result<&'static PrometheusHandle, MetricsError> {
    let _guard = INSTALL_LOCK.lock();
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;

    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle);
    init_metrics();
    Ok(handle)
}

/// Render metrics in the text exposition format
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::recorder::record_chunk_rejected;

    #[test]
    fn test_install_is_idempotent() {
        let first = install_recorder().unwrap() as *const PrometheusHandle;
        let second = install_recorder().unwrap() as *const PrometheusHandle;
        assert_eq!(first, second);

        record_chunk_rejected("size");
        let text = render_metrics().unwrap();
        assert!(text.contains("mediatrace_chunks_rejected_total"));
    }
}
