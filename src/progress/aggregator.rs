use crate::progress::error::{ProgressError, ProgressResult};
use crate::progress::store::ProgressStore;
use crate::task::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FIELD_STAGE: &str = "stage";
pub const FIELD_PERCENT: &str = "percent";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_STATUS: &str = "status";

/// Store key holding the progress fields of one task.
pub fn progress_key(task_id: i64) -> String {
    format!("analysis:progress:{}", task_id)
}

/// One progress report from an engine. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: Option<String>,
    pub percent: Option<f64>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, percent: f64) -> Self {
        Self {
            stage: Some(stage.into()),
            percent: Some(percent),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Collects fine-grained engine progress into per-task field maps.
#[derive(Clone)]
pub struct ProgressAggregator {
    store: Arc<dyn ProgressStore>,
    ttl: Duration,
    grace: Duration,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn ProgressStore>, ttl: Duration, grace: Duration) -> Self {
        Self { store, ttl, grace }
    }

    /// Record a progress report. Percent never moves backwards; an older
    /// or equal percent is ignored while the other fields still apply.
    pub async fn report(&self, task_id: i64, update: ProgressUpdate) -> ProgressResult<()> {
        let key = progress_key(task_id);

        if let Some(percent) = update.percent {
            if !percent.is_finite() {
                return Err(ProgressError::InvalidValue {
                    field: FIELD_PERCENT.to_string(),
                    value: percent.to_string(),
                });
            }
            let clamped = percent.clamp(0.0, 100.0);
            let raised = self
                .store
                .set_field_if_greater(&key, FIELD_PERCENT, clamped, self.ttl)
                .await?;
            if !raised {
                debug!(task_id, percent = clamped, "Stale progress percent ignored");
            }
        }

        let mut fields: Vec<(&str, String)> = Vec::with_capacity(3);
        if let Some(stage) = update.stage {
            fields.push((FIELD_STAGE, stage));
        }
        if let Some(message) = update.message {
            fields.push((FIELD_MESSAGE, message));
        }
        fields.push((FIELD_TIMESTAMP, now_millis().to_string()));

        self.store.set_fields(&key, &fields, self.ttl).await
    }

    /// Current fields for `task_id`; empty if nothing was reported or the
    /// entry expired.
    pub async fn get_progress(&self, task_id: i64) -> ProgressResult<HashMap<String, String>> {
        self.store.get_all(&progress_key(task_id)).await
    }

    /// Stamp the terminal status and let the entry expire after the grace
    /// period.
    pub async fn finish(
        &self,
        task_id: i64,
        status: TaskStatus,
        message: Option<&str>,
    ) -> ProgressResult<()> {
        let key = progress_key(task_id);

        if status == TaskStatus::Completed {
            self.store
                .set_field_if_greater(&key, FIELD_PERCENT, 100.0, self.grace)
                .await?;
        }

        let mut fields = vec![
            (FIELD_STATUS, status.as_str().to_string()),
            (FIELD_TIMESTAMP, now_millis().to_string()),
        ];
        if let Some(message) = message {
            fields.push((FIELD_MESSAGE, message.to_string()));
        }
        self.store.set_fields(&key, &fields, self.grace).await?;
        self.store.expire(&key, self.grace).await?;
        Ok(())
    }

    /// Periodically purge expired entries until `shutdown` fires.
    pub fn spawn_gc(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Progress GC stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.purge_expired().await {
                            Ok(0) => {}
                            Ok(purged) => debug!(purged, "Expired progress entries purged"),
                            Err(e) => warn!(error = %e, "Progress GC sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::store::MemoryProgressStore;

    fn aggregator() -> ProgressAggregator {
        ProgressAggregator::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(60),
            Duration::from_millis(40),
        )
    }

    #[test]
    fn test_key_format() {
        assert_eq!(progress_key(17), "analysis:progress:17");
    }

    #[tokio::test]
    async fn test_percent_is_monotonic() {
        let agg = aggregator();
        agg.report(5, ProgressUpdate::new("decode", 40.0)).await.unwrap();
        agg.report(5, ProgressUpdate::new("score", 20.0)).await.unwrap();

        let fields = agg.get_progress(5).await.unwrap();
        assert_eq!(fields.get(FIELD_PERCENT).map(String::as_str), Some("40"));
        assert_eq!(fields.get(FIELD_STAGE).map(String::as_str), Some("score"));
        assert!(fields.contains_key(FIELD_TIMESTAMP));
    }

    #[tokio::test]
    async fn test_percent_is_clamped_and_validated() {
        let agg = aggregator();
        agg.report(1, ProgressUpdate::new("x", 250.0)).await.unwrap();
        let fields = agg.get_progress(1).await.unwrap();
        assert_eq!(fields.get(FIELD_PERCENT).map(String::as_str), Some("100"));

        let err = agg
            .report(1, ProgressUpdate::new("x", f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_unknown_task_is_empty() {
        let agg = aggregator();
        assert!(agg.get_progress(404).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_expires_after_grace() {
        let agg = aggregator();
        agg.report(9, ProgressUpdate::new("scan", 70.0).with_message("half way"))
            .await
            .unwrap();
        agg.finish(9, TaskStatus::Completed, None).await.unwrap();

        let fields = agg.get_progress(9).await.unwrap();
        assert_eq!(fields.get(FIELD_PERCENT).map(String::as_str), Some("100"));
        assert_eq!(fields.get(FIELD_STATUS).map(String::as_str), Some("COMPLETED"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(agg.get_progress(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_keeps_last_percent() {
        let agg = aggregator();
        agg.report(3, ProgressUpdate::new("scan", 30.0)).await.unwrap();
        agg.finish(3, TaskStatus::Failed, Some("decoder crashed"))
            .await
            .unwrap();

        let fields = agg.get_progress(3).await.unwrap();
        assert_eq!(fields.get(FIELD_PERCENT).map(String::as_str), Some("30"));
        assert_eq!(
            fields.get(FIELD_MESSAGE).map(String::as_str),
            Some("decoder crashed")
        );
    }

    #[tokio::test]
    async fn test_gc_stops_on_cancel() {
        let agg = aggregator();
        let token = CancellationToken::new();
        let handle = agg.spawn_gc(Duration::from_millis(5), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
