use crate::chunk::UploadStore;
use crate::config::TopicConfig;
use crate::dispatch::{
    DispatchMessage, DispatchResult, EngineParams, EngineType, Envelope, ExecutionMode, MessageBus,
    MessagePublisher, ResultMessage,
};
use crate::metrics::EngineRunTimer;
use crate::progress::ProgressAggregator;
use crate::storage::ObjectStore;
use crate::task::{Actor, TaskError, TaskStateMachine, TaskStatus, TaskStore, TaskUpdate};
use crate::worker::engine::{Engine, EngineInput, ProgressReporter};
use crate::worker::error::WorkerResult;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the pool did with one dispatch message.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Engine ran (or could not run) and a result was published
    Reported(ResultMessage),
    /// Task was cancelled, finished or unknown; nothing was run
    Skipped,
}

/// Bounded pool for in-process engines.
///
/// Each partition of each in-process topic is drained by its own consumer,
/// one message at a time, so messages for one file run in publish order.
/// A shared semaphore caps how many engines run at once.
pub struct WorkerPool {
    engines: HashMap<EngineType, Arc<dyn Engine>>,
    tasks: Arc<TaskStore>,
    uploads: Arc<UploadStore>,
    objects: Arc<dyn ObjectStore>,
    progress: ProgressAggregator,
    publisher: Arc<dyn MessagePublisher>,
    results_topic: String,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<TaskStore>,
        uploads: Arc<UploadStore>,
        objects: Arc<dyn ObjectStore>,
        progress: ProgressAggregator,
        publisher: Arc<dyn MessagePublisher>,
        results_topic: impl Into<String>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            engines: HashMap::new(),
            tasks,
            uploads,
            objects,
            progress,
            publisher,
            results_topic: results_topic.into(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engines.insert(engine.engine_type(), engine);
        self
    }

    pub fn engine_types(&self) -> Vec<EngineType> {
        let mut types: Vec<EngineType> = self.engines.keys().copied().collect();
        types.sort();
        types
    }

    /// Start consumers for every in-process engine topic.
    ///
    /// In-process engines without a registered implementation are still
    /// consumed; their tasks fail with an explanatory result rather than
    /// waiting forever.
    pub fn spawn(
        self: &Arc<Self>,
        bus: &MessageBus,
        topics: &TopicConfig,
        shutdown: CancellationToken,
    ) -> DispatchResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for engine in EngineType::ALL {
            if engine.execution_mode() != ExecutionMode::InProcess {
                continue;
            }
            let topic = engine.topic(topics);
            for rx in bus.subscribe_all(topic)? {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move { pool.consume(rx, shutdown).await }));
            }
            info!(
                engine = %engine,
                topic,
                registered = self.engines.contains_key(&engine),
                "Worker consumers started"
            );
        }

        Ok(handles)
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

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Err(e) = self.process(&envelope).await {
                error!(
                    topic = %envelope.topic,
                    offset = envelope.offset,
                    error = %e,
                    "Dispatch message not processed"
                );
            }
            drop(permit);
        }
        debug!("Worker consumer stopped");
    }

    /// Decode and run one message from a dispatch topic.
    pub async fn process(&self, envelope: &Envelope) -> WorkerResult<JobOutcome> {
        match DispatchMessage::decode(&envelope.payload) {
            Ok(message) => self.run_job(message).await,
            Err(e) => {
                warn!(
                    topic = %envelope.topic,
                    offset = envelope.offset,
                    error = %e,
                    "Dropping malformed dispatch message"
                );
                Ok(JobOutcome::Skipped)
            }
        }
    }

    pub async fn run_job(&self, message: DispatchMessage) -> WorkerResult<JobOutcome> {
        let task_id = message.task_id;

        if !self.mark_running(task_id).await? {
            return Ok(JobOutcome::Skipped);
        }

        let result = match self.execute(&message).await {
            Ok(payload) => ResultMessage::success(task_id, payload),
            Err(reason) => {
                warn!(task_id, engine = %message.engine_type, reason = %reason, "Engine failed");
                ResultMessage::failure(task_id, reason)
            }
        };

        self.publisher
            .publish(&self.results_topic, &message.file_id, result.encode()?)
            .await?;
        debug!(task_id, success = result.success, "Result published");

        Ok(JobOutcome::Reported(result))
    }

    /// Move the task to RUNNING. Returns false when it must not run.
    async fn mark_running(&self, task_id: i64) -> WorkerResult<bool> {
        let Some(task) = self.tasks.get(task_id).await? else {
            warn!(task_id, "Dispatch message for unknown task");
            return Ok(false);
        };

        match task.status {
            TaskStatus::Running => return Ok(true),
            status if status.is_terminal() => {
                debug!(task_id, status = %status, "Task already finished, not running");
                return Ok(false);
            }
            _ => {}
        }

        let Some(event) = TaskStateMachine::resume_event(task.status) else {
            warn!(task_id, status = %task.status, "Task not runnable");
            return Ok(false);
        };

        match self
            .tasks
            .apply(task_id, event, Actor::Worker, TaskUpdate::default())
            .await
        {
            Ok(_) => Ok(true),
            // Cancelled between the read and the write
            Err(TaskError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(&self, message: &DispatchMessage) -> Result<serde_json::Value, String> {
        let engine = self
            .engines
            .get(&message.engine_type)
            .cloned()
            .ok_or_else(|| format!("no in-process {} engine is available", message.engine_type))?;

        let params = message.params().map_err(|e| e.to_string())?;
        let input = self.load_input(message.clone(), params).await?;
        let reporter =
            ProgressReporter::new(message.task_id, self.progress.clone(), self.tasks.clone());

        let timer = EngineRunTimer::start(message.engine_type.as_str());
        let result = engine.run(&input, &reporter).await;
        timer.finish(result.is_ok());
        result
    }

    async fn load_input(
        &self,
        message: DispatchMessage,
        params: EngineParams,
    ) -> Result<EngineInput, String> {
        let file = self
            .uploads
            .get_file(&message.file_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("file {} not found", message.file_id))?;
        let key = file
            .storage_key
            .clone()
            .ok_or_else(|| format!("file {} has no merged object", message.file_id))?;
        let media: Bytes = self.objects.get(&key).await.map_err(|e| e.to_string())?;

        Ok(EngineInput {
            message,
            params,
            file,
            media,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkRegistry, ChunkUpload};
    use crate::config::UploadConfig;
    use crate::db;
    use crate::dispatch::{EngineParams, MetadataParams};
    use crate::integrity::ChecksumType;
    use crate::materializer::{ChunkRetention, FileMaterializer};
    use crate::progress::MemoryProgressStore;
    use crate::storage::MemoryObjectStore;
    use crate::task::TaskEvent;
    use crate::worker::MetadataEngine;
    use std::time::Duration;

    struct Fixture {
        pool: Arc<WorkerPool>,
        tasks: Arc<TaskStore>,
        bus: Arc<MessageBus>,
        progress: ProgressAggregator,
    }

    async fn fixture() -> Fixture {
        let db = db::connect_in_memory().await.unwrap();
        let uploads = Arc::new(UploadStore::new(db.clone()).await.unwrap());
        let tasks = Arc::new(TaskStore::new(db).await.unwrap());
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let materializer = Arc::new(FileMaterializer::new(
            uploads.clone(),
            objects.clone(),
            ChecksumType::Md5,
            ChunkRetention::DeleteBlobs,
        ));
        let registry = ChunkRegistry::new(
            uploads.clone(),
            objects.clone(),
            materializer,
            UploadConfig::default(),
        );

        let data = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4]);
        registry
            .accept_chunk(ChunkUpload {
                file_id: "jpeg-1".into(),
                file_name: "photo.jpg".into(),
                chunk_index: 0,
                total_chunks: 1,
                total_size: data.len() as u64,
                chunk_hash: None,
                data,
            })
            .await
            .unwrap();

        let bus = Arc::new(MessageBus::new(2, 16, Duration::from_millis(50)));
        let progress = ProgressAggregator::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let pool = WorkerPool::new(
            tasks.clone(),
            uploads,
            objects,
            progress.clone(),
            bus.clone(),
            "analysis-results",
            2,
        )
        .with_engine(Arc::new(MetadataEngine));

        Fixture {
            pool: Arc::new(pool),
            tasks,
            bus,
            progress,
        }
    }

    fn message(task_id: i64, params: &EngineParams) -> DispatchMessage {
        DispatchMessage::new(task_id, "jpeg-1", "memory://jpeg-1/photo.jpg", params).unwrap()
    }

    #[tokio::test]
    async fn test_metadata_job_reports_result() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("jpeg-1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;

        let outcome = f
            .pool
            .run_job(message(id, &EngineParams::Metadata(MetadataParams::default())))
            .await
            .unwrap();

        let JobOutcome::Reported(result) = outcome else {
            panic!("expected a result");
        };
        assert!(result.success);
        assert_eq!(result.payload["detectedFormat"], "jpeg");
        assert_eq!(result.payload["extensionMatches"], true);
        assert_eq!(result.payload["size"], 8);

        // RUNNING until the collector applies the result
        let task = f.tasks.require(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.progress, 100);

        let fields = f.progress.get_progress(id).await.unwrap();
        assert_eq!(fields.get("stage").map(String::as_str), Some("done"));

        let partition = f.bus.partition_for("jpeg-1");
        let mut rx = f.bus.subscribe("analysis-results", partition).unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(ResultMessage::decode(&envelope.payload).unwrap(), result);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_run() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("jpeg-1", None, &[EngineType::Metadata])
            .await
            .unwrap();
        let id = tree.children[0].id;
        f.tasks
            .apply(id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
            .await
            .unwrap();

        let outcome = f
            .pool
            .run_job(message(id, &EngineParams::Metadata(MetadataParams::default())))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(f.bus.pending("analysis-results"), 0);
    }

    #[tokio::test]
    async fn test_missing_engine_reports_failure() {
        let f = fixture().await;
        let tree = f
            .tasks
            .create_analysis("jpeg-1", None, &[EngineType::TraditionalImage])
            .await
            .unwrap();
        let id = tree.children[0].id;

        let outcome = f
            .pool
            .run_job(message(
                id,
                &EngineParams::defaults(EngineType::TraditionalImage),
            ))
            .await
            .unwrap();

        let JobOutcome::Reported(result) = outcome else {
            panic!("expected a result");
        };
        assert!(!result.success);
        assert!(result.error_message().contains("TRADITIONAL_IMAGE"));
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let f = fixture().await;
        let envelope = Envelope {
            topic: "metadata-analysis".into(),
            partition: 0,
            offset: 0,
            key: "jpeg-1".into(),
            payload: Bytes::from_static(b"{"),
        };
        assert_eq!(f.pool.process(&envelope).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(f.pool.engine_types(), vec![EngineType::Metadata]);
    }
}
