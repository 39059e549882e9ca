use crate::dispatch::{DispatchResult, Envelope, MessageBus, ResultMessage};
use crate::metrics;
use crate::progress::ProgressAggregator;
use crate::task::{
    Actor, AnalysisTask, TaskError, TaskEvent, TaskResult, TaskStateMachine, TaskStatus, TaskStore,
    TaskUpdate,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_APPLY_ATTEMPTS: usize = 3;

/// What handling one result message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The task was finalized by this message
    Applied,
    /// Same terminal status and payload already stored (redelivery)
    Duplicate,
    /// The task exists but cannot take this result (finished differently,
    /// cancelled, an aggregate, or never queued)
    Ignored,
    /// No task matches the message; it was logged and dropped
    Unresolved,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Ignored => "ignored",
            ApplyOutcome::Unresolved => "unresolved",
        }
    }
}

/// Consumes the results topic and correlates each message with its task.
///
/// Handling is idempotent: a redelivered message finds the task already in
/// the requested terminal state with the same payload and changes nothing.
#[derive(Clone)]
pub struct ResultCollector {
    tasks: Arc<TaskStore>,
    progress: ProgressAggregator,
}

impl ResultCollector {
    pub fn new(tasks: Arc<TaskStore>, progress: ProgressAggregator) -> Self {
        Self { tasks, progress }
    }

    /// Start one consumer per partition of `topic`; they stop when `shutdown`
    /// fires.
    pub fn spawn(
        &self,
        bus: &MessageBus,
        topic: &str,
        shutdown: CancellationToken,
    ) -> DispatchResult<Vec<JoinHandle<()>>> {
        let receivers = bus.subscribe_all(topic)?;
        info!(topic, partitions = receivers.len(), "Result collector started");

        Ok(receivers
            .into_iter()
            .map(|rx| {
                let collector = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { collector.consume(rx, shutdown).await })
            })
            .collect())
    }

    async fn consume(&self, mut rx: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if let Err(e) = self.handle_envelope(&envelope).await {
                // No dead-letter path; the message is lost
                error!(
                    topic = %envelope.topic,
                    partition = envelope.partition,
                    offset = envelope.offset,
                    error = %e,
                    "Failed to apply result message"
                );
            }
        }
        debug!("Result consumer stopped");
    }

    /// Decode and apply one raw message from the results topic.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> TaskResult<ApplyOutcome> {
        match ResultMessage::decode(&envelope.payload) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!(
                    topic = %envelope.topic,
                    partition = envelope.partition,
                    offset = envelope.offset,
                    error = %e,
                    "Dropping malformed result message"
                );
                metrics::record_result_dropped("malformed");
                Ok(ApplyOutcome::Unresolved)
            }
        }
    }

    pub async fn handle(&self, message: ResultMessage) -> TaskResult<ApplyOutcome> {
        let Some(task_id) = message.numeric_task_id() else {
            warn!(task_id = %message.task_id, "Dropping result with non-numeric task id");
            metrics::record_result_dropped("non_numeric");
            return Ok(ApplyOutcome::Unresolved);
        };

        let outcome = self.apply(task_id, &message).await?;
        metrics::record_result_applied(outcome.as_str());
        Ok(outcome)
    }

    async fn apply(&self, task_id: i64, message: &ResultMessage) -> TaskResult<ApplyOutcome> {
        let target = if message.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        for _ in 0..MAX_APPLY_ATTEMPTS {
            let Some(task) = self.tasks.get(task_id).await? else {
                warn!(task_id, "Dropping result for unknown task");
                metrics::record_result_dropped("unknown_task");
                return Ok(ApplyOutcome::Unresolved);
            };

            if task.is_aggregate() {
                warn!(task_id, "Ignoring result addressed to an aggregate task");
                return Ok(ApplyOutcome::Ignored);
            }

            if task.status.is_terminal() {
                return Ok(classify_finished(&task, target, message));
            }

            match self.finalize(&task, target, message).await {
                Ok(task) => {
                    info!(
                        task_id,
                        engine = ?task.engine_type,
                        status = %task.status,
                        "Task finalized"
                    );
                    self.after_finalize(&task).await?;
                    return Ok(ApplyOutcome::Applied);
                }
                Err(TaskError::InvalidTransition { from, .. }) if from == TaskStatus::Pending => {
                    warn!(task_id, "Ignoring result for a task that was never queued");
                    return Ok(ApplyOutcome::Ignored);
                }
                // A worker or user moved the task under us; look again
                Err(TaskError::InvalidTransition { .. }) | Err(TaskError::Contended(_)) => {
                    debug!(task_id, "Task changed while applying result, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TaskError::Contended(task_id))
    }

    async fn finalize(
        &self,
        task: &AnalysisTask,
        target: TaskStatus,
        message: &ResultMessage,
    ) -> TaskResult<AnalysisTask> {
        if let Some(event) = TaskStateMachine::resume_event(task.status) {
            self.tasks
                .apply(task.id, event, Actor::Collector, TaskUpdate::default())
                .await?;
        }

        let (event, update) = match target {
            TaskStatus::Completed => (
                TaskEvent::Complete,
                TaskUpdate::with_result(message.payload.clone()),
            ),
            _ => (
                TaskEvent::Fail,
                TaskUpdate::with_error(message.error_message(), Some(message.payload.clone())),
            ),
        };
        self.tasks.apply(task.id, event, Actor::Collector, update).await
    }

    async fn after_finalize(&self, task: &AnalysisTask) -> TaskResult<()> {
        if let Err(e) = self
            .progress
            .finish(task.id, task.status, task.error_message.as_deref())
            .await
        {
            warn!(task_id = task.id, error = %e, "Failed to stamp final progress");
        }

        if let Some(parent_id) = task.parent_task_id {
            self.tasks.roll_up(parent_id).await?;
        }
        Ok(())
    }
}

fn classify_finished(
    task: &AnalysisTask,
    target: TaskStatus,
    message: &ResultMessage,
) -> ApplyOutcome {
    if task.status == target && task.result_payload.as_ref() == Some(&message.payload) {
        debug!(task_id = task.id, status = %task.status, "Duplicate result ignored");
        ApplyOutcome::Duplicate
    } else {
        warn!(
            task_id = task.id,
            status = %task.status,
            success = message.success,
            "Ignoring result for a finished task"
        );
        ApplyOutcome::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::dispatch::{EngineType, MessagePublisher};
    use crate::progress::MemoryProgressStore;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        collector: ResultCollector,
        tasks: Arc<TaskStore>,
        progress: ProgressAggregator,
    }

    async fn fixture() -> Fixture {
        let pool = db::connect_in_memory().await.unwrap();
        let tasks = Arc::new(TaskStore::new(pool).await.unwrap());
        let progress = ProgressAggregator::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        Fixture {
            collector: ResultCollector::new(tasks.clone(), progress.clone()),
            tasks,
            progress,
        }
    }

    #[tokio::test]
    async fn test_failure_result_is_idempotent() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::ImageAi])
            .await
            .unwrap();
        let id = tree.children[0].id;

        let message = ResultMessage::failure(id, "model crashed");
        assert_eq!(
            f.collector.handle(message.clone()).await.unwrap(),
            ApplyOutcome::Applied
        );
        let first = f.tasks.require(id).await.unwrap();
        assert_eq!(first.status, TaskStatus::Failed);
        assert_eq!(first.error_message.as_deref(), Some("model crashed"));
        assert_eq!(first.result_payload, Some(json!({"error": "model crashed"})));

        assert_eq!(
            f.collector.handle(message).await.unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(f.tasks.require(id).await.unwrap(), first);

        // The only child failed, so the aggregate fails too
        let aggregate = f.tasks.require(tree.aggregate.id).await.unwrap();
        assert_eq!(aggregate.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_success_from_running() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::Metadata, EngineType::ImageAi])
            .await
            .unwrap();
        let id = tree.children[0].id;
        f.tasks
            .apply(id, TaskEvent::Start, Actor::Worker, TaskUpdate::default())
            .await
            .unwrap();

        let outcome = f
            .collector
            .handle(ResultMessage::success(id, json!({"size": 10})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let task = f.tasks.require(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);

        let fields = f.progress.get_progress(id).await.unwrap();
        assert_eq!(fields.get("status").map(String::as_str), Some("COMPLETED"));

        // One of two children done: aggregate still open at half progress
        let aggregate = f.tasks.require(tree.aggregate.id).await.unwrap();
        assert_eq!(aggregate.status, TaskStatus::Queued);
        assert_eq!(aggregate.progress, 50);
    }

    #[tokio::test]
    async fn test_conflicting_redelivery_is_ignored() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;

        f.collector
            .handle(ResultMessage::success(id, json!({"ok": true})))
            .await
            .unwrap();
        let outcome = f
            .collector
            .handle(ResultMessage::failure(id, "late failure"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(
            f.tasks.require(id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancelled_task_ignores_result() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;
        f.tasks
            .apply(id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
            .await
            .unwrap();

        let outcome = f
            .collector
            .handle(ResultMessage::success(id, json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_unresolvable_results_are_dropped() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();

        let non_numeric = ResultMessage::decode(br#"{"taskId":"job-1","success":true}"#).unwrap();
        assert_eq!(
            f.collector.handle(non_numeric).await.unwrap(),
            ApplyOutcome::Unresolved
        );
        assert_eq!(
            f.collector
                .handle(ResultMessage::success(9999, json!({})))
                .await
                .unwrap(),
            ApplyOutcome::Unresolved
        );
        assert_eq!(
            f.collector
                .handle(ResultMessage::success(tree.aggregate.id, json!({})))
                .await
                .unwrap(),
            ApplyOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_consumes_results_topic() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("f1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;

        let bus = MessageBus::new(2, 8, Duration::from_millis(50));
        let shutdown = CancellationToken::new();
        let handles = f
            .collector
            .spawn(&bus, "analysis-results", shutdown.clone())
            .unwrap();

        bus.publish("analysis-results", "f1", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        bus.publish(
            "analysis-results",
            "f1",
            ResultMessage::success(id, json!({"done": true})).encode().unwrap(),
        )
        .await
        .unwrap();

        let mut status = TaskStatus::Queued;
        for _ in 0..50 {
            status = f.tasks.require(id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Completed);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
