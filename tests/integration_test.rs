use async_trait::async_trait;
use bytes::Bytes;
use mediatrace::chunk::{ChunkError, ChunkRegistry, ChunkUpload, UploadStatus, UploadStore};
use mediatrace::collector::{ApplyOutcome, ResultCollector};
use mediatrace::config::{TopicConfig, UploadConfig};
use mediatrace::coordinator::{EngineSelection, StartAnalysisRequest, TaskOrchestrator};
use mediatrace::db;
use mediatrace::dispatch::{DispatchMessage, EngineType, MessageBus, ResultMessage};
use mediatrace::integrity::{ChecksumType, IntegrityVerifier};
use mediatrace::materializer::{ChunkRetention, FileMaterializer};
use mediatrace::progress::{MemoryProgressStore, ProgressAggregator, ProgressUpdate};
use mediatrace::storage::{MemoryObjectStore, ObjectStore, ObjectWriter, StorageResult};
use mediatrace::task::{TaskStatus, TaskStore};
use mediatrace::worker::{MetadataEngine, WorkerPool};
use mediatrace::ErrorKind;
use rand::RngCore;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Memory store that counts merge writes.
struct CountingStore {
    inner: MemoryObjectStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        self.inner.size(key).await
    }

    async fn begin_write(&self, key: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_write(key).await
    }

    fn url_for(&self, key: &str) -> String {
        self.inner.url_for(key)
    }
}

struct Harness {
    registry: Arc<ChunkRegistry>,
    orchestrator: TaskOrchestrator,
    tasks: Arc<TaskStore>,
    uploads: Arc<UploadStore>,
    objects: Arc<CountingStore>,
    bus: Arc<MessageBus>,
    progress: ProgressAggregator,
    topics: TopicConfig,
}

async fn harness() -> Harness {
    let pool = db::connect_in_memory().await.unwrap();
    let uploads = Arc::new(UploadStore::new(pool.clone()).await.unwrap());
    let tasks = Arc::new(TaskStore::new(pool).await.unwrap());
    let objects = Arc::new(CountingStore::new());
    let dyn_objects: Arc<dyn ObjectStore> = objects.clone();

    let materializer = Arc::new(FileMaterializer::new(
        uploads.clone(),
        dyn_objects.clone(),
        ChecksumType::Md5,
        ChunkRetention::DeleteBlobs,
    ));
    let registry = Arc::new(ChunkRegistry::new(
        uploads.clone(),
        dyn_objects.clone(),
        materializer,
        UploadConfig::default(),
    ));

    let bus = Arc::new(MessageBus::new(4, 64, Duration::from_millis(100)));
    let progress = ProgressAggregator::new(
        Arc::new(MemoryProgressStore::new()),
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let topics = TopicConfig::default();
    let orchestrator = TaskOrchestrator::new(
        uploads.clone(),
        tasks.clone(),
        bus.clone(),
        dyn_objects,
        topics.clone(),
        progress.clone(),
    );

    Harness {
        registry,
        orchestrator,
        tasks,
        uploads,
        objects,
        bus,
        progress,
        topics,
    }
}

fn chunk(file_id: &str, file_name: &str, index: u32, total: u32, size: u64, data: &[u8]) -> ChunkUpload {
    ChunkUpload {
        file_id: file_id.to_string(),
        file_name: file_name.to_string(),
        chunk_index: index,
        total_chunks: total,
        total_size: size,
        data: Bytes::copy_from_slice(data),
        chunk_hash: Some(IntegrityVerifier::calculate_checksum(ChecksumType::Md5, data)),
    }
}

async fn upload_jpeg(h: &Harness, file_id: &str) {
    let data = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    h.registry
        .accept_chunk(chunk(file_id, "evidence.jpg", 0, 1, data.len() as u64, &data))
        .await
        .unwrap();
}

async fn wait_for_status(tasks: &TaskStore, id: i64, status: TaskStatus) {
    for _ in 0..200 {
        if tasks.require(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task {id} never reached {status}; last seen {}",
        tasks.require(id).await.unwrap().status
    );
}

/// Three chunks of a 1 MiB file
#[tokio::test]
async fn test_three_chunk_upload_completes() {
    let h = harness().await;
    let mut data = vec![0u8; 1_048_576];
    rand::thread_rng().fill_bytes(&mut data);
    let parts: Vec<&[u8]> = data.chunks(349_526).collect();
    assert_eq!(parts.len(), 3);

    for (index, part) in parts.iter().take(2).enumerate() {
        h.registry
            .accept_chunk(chunk("abc123def456", "scene.mp4", index as u32, 3, 1_048_576, part))
            .await
            .unwrap();
    }
    let progress = h.registry.get_upload_progress("abc123def456").await.unwrap();
    assert_eq!(progress.uploaded_chunk_count, 2);
    assert_eq!(progress.missing_chunk_indices, vec![2]);
    assert!(!progress.materialized);

    let progress = h
        .registry
        .accept_chunk(chunk("abc123def456", "scene.mp4", 2, 3, 1_048_576, parts[2]))
        .await
        .unwrap();
    assert_eq!(progress.progress_percent, 100.0);
    assert!(progress.missing_chunk_indices.is_empty());
    assert_eq!(progress.upload_status, UploadStatus::Completed);
    assert!(progress.materialized);

    let merged = h.objects.get("abc123def456/scene.mp4").await.unwrap();
    assert_eq!(merged.as_ref(), data.as_slice());
    assert_eq!(h.objects.writes(), 1);

    // Staged chunk blobs are dropped after publication
    assert!(h
        .objects
        .inner
        .keys_with_prefix("abc123def456/chunks/")
        .is_empty());
}

/// A bad hash is rejected without advancing the count
#[tokio::test]
async fn test_bad_chunk_hash_does_not_advance() {
    let h = harness().await;
    h.registry
        .accept_chunk(chunk("c-1", "photo.jpg", 0, 2, 8, b"abcd"))
        .await
        .unwrap();

    let mut bad = chunk("c-1", "photo.jpg", 1, 2, 8, b"efgh");
    bad.chunk_hash = Some(IntegrityVerifier::calculate_checksum(ChecksumType::Md5, b"wxyz"));
    let err = h.registry.accept_chunk(bad).await.unwrap_err();
    assert!(matches!(err, ChunkError::ChecksumMismatch { chunk_index: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let progress = h.registry.get_upload_progress("c-1").await.unwrap();
    assert_eq!(progress.uploaded_chunk_count, 1);
    assert_eq!(progress.missing_chunk_indices, vec![1]);

    // A corrected resubmission completes the upload
    let progress = h
        .registry
        .accept_chunk(chunk("c-1", "photo.jpg", 1, 2, 8, b"efgh"))
        .await
        .unwrap();
    assert!(progress.materialized);
}

#[tokio::test]
async fn test_concurrent_final_chunk_merges_once() {
    let h = harness().await;
    h.registry
        .accept_chunk(chunk("race-1", "clip.avi", 0, 2, 8, b"abcd"))
        .await
        .unwrap();

    let last = chunk("race-1", "clip.avi", 1, 2, 8, b"efgh");
    let attempts = (0..4).map(|_| h.registry.accept_chunk(last.clone()));
    let results = futures::future::join_all(attempts).await;
    assert!(results.iter().any(Result::is_ok));
    assert_eq!(h.objects.writes(), 1);

    // Late duplicates and explicit merges reuse the published object
    h.registry
        .accept_chunk(chunk("race-1", "clip.avi", 1, 2, 8, b"efgh"))
        .await
        .unwrap();
    let file = h.registry.retry_merge("race-1").await.unwrap();
    assert_eq!(file.storage_key, "race-1/clip.avi");
    assert_eq!(h.objects.writes(), 1);

    let record = h.uploads.get_file("race-1").await.unwrap().unwrap();
    assert_eq!(record.upload_status, UploadStatus::Completed);
    assert_eq!(record.storage_key.as_deref(), Some("race-1/clip.avi"));
}

/// One dispatch for the image engine, video engine skipped
#[tokio::test]
async fn test_start_analysis_dispatches_and_skips() {
    let h = harness().await;
    upload_jpeg(&h, "img-1").await;

    let response = h
        .orchestrator
        .start_analysis(StartAnalysisRequest::new(
            "img-1",
            vec![
                EngineSelection::new(EngineType::ImageAi),
                EngineSelection::new(EngineType::VideoAi),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.dispatched_count(), 1);
    assert!(!response.outcome(EngineType::VideoAi).unwrap().is_dispatched());

    let tree = h
        .orchestrator
        .get_task_tree(response.aggregate_task_id)
        .await
        .unwrap();
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].engine_type, Some(EngineType::ImageAi));

    assert_eq!(h.bus.pending(&h.topics.image_ai), 1);
    assert_eq!(h.bus.pending(&h.topics.video_ai), 0);

    let mut rx = h
        .bus
        .subscribe(&h.topics.image_ai, h.bus.partition_for("img-1"))
        .unwrap();
    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.key, "img-1");
    let message = DispatchMessage::decode(&envelope.payload).unwrap();
    assert_eq!(message.task_id, tree.children[0].id);
}

/// A failure result is applied once
#[tokio::test]
async fn test_failure_redelivery_is_noop() {
    let h = harness().await;
    upload_jpeg(&h, "img-2").await;
    let response = h
        .orchestrator
        .start_analysis(StartAnalysisRequest::new(
            "img-2",
            vec![EngineSelection::new(EngineType::ImageAi)],
        ))
        .await
        .unwrap();
    let task_id = response.outcome(EngineType::ImageAi).unwrap().task_id.unwrap();

    let collector = ResultCollector::new(h.tasks.clone(), h.progress.clone());
    let failure = ResultMessage::failure(task_id, "gpu out of memory");

    assert_eq!(
        collector.handle(failure.clone()).await.unwrap(),
        ApplyOutcome::Applied
    );
    let first = h.tasks.require(task_id).await.unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.error_message.as_deref(), Some("gpu out of memory"));
    assert_eq!(
        first.result_payload,
        Some(json!({"error": "gpu out of memory"}))
    );

    assert_eq!(
        collector.handle(failure).await.unwrap(),
        ApplyOutcome::Duplicate
    );
    assert_eq!(h.tasks.require(task_id).await.unwrap(), first);

    // A late success for the same task does not overwrite the failure
    assert_eq!(
        collector
            .handle(ResultMessage::success(task_id, json!({"score": 0.1})))
            .await
            .unwrap(),
        ApplyOutcome::Ignored
    );
    assert_eq!(h.tasks.require(task_id).await.unwrap(), first);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let h = harness().await;

    h.progress
        .report(7, ProgressUpdate::new("decode", 40.0))
        .await
        .unwrap();
    h.progress
        .report(7, ProgressUpdate::new("decode", 30.0).with_message("late report"))
        .await
        .unwrap();

    let fields = h.progress.get_progress(7).await.unwrap();
    assert_eq!(fields.get("percent").map(String::as_str), Some("40"));
    assert_eq!(fields.get("message").map(String::as_str), Some("late report"));

    h.progress
        .report(7, ProgressUpdate::new("infer", 150.0))
        .await
        .unwrap();
    let fields = h.progress.get_progress(7).await.unwrap();
    assert_eq!(fields.get("percent").map(String::as_str), Some("100"));
    assert_eq!(fields.get("stage").map(String::as_str), Some("infer"));
}

#[tokio::test]
async fn test_cancel_cascades_to_children() {
    let h = harness().await;
    upload_jpeg(&h, "img-3").await;
    let response = h
        .orchestrator
        .start_analysis(StartAnalysisRequest::new(
            "img-3",
            vec![
                EngineSelection::new(EngineType::ImageAi),
                EngineSelection::new(EngineType::Metadata),
            ],
        ))
        .await
        .unwrap();

    let tree = h
        .orchestrator
        .cancel_task(response.aggregate_task_id)
        .await
        .unwrap();
    assert_eq!(tree.aggregate.status, TaskStatus::Cancelled);
    assert_eq!(tree.children.len(), 2);
    assert!(tree
        .children
        .iter()
        .all(|child| child.status == TaskStatus::Cancelled));

    let err = h
        .orchestrator
        .cancel_task(response.aggregate_task_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_in_process_pipeline_completes_aggregate() {
    let h = harness().await;
    upload_jpeg(&h, "img-4").await;

    let shutdown = CancellationToken::new();
    let collector = ResultCollector::new(h.tasks.clone(), h.progress.clone());
    let mut handles = collector
        .spawn(&h.bus, &h.topics.results, shutdown.clone())
        .unwrap();

    let workers = Arc::new(
        WorkerPool::new(
            h.tasks.clone(),
            h.uploads.clone(),
            h.objects.clone(),
            h.progress.clone(),
            h.bus.clone(),
            h.topics.results.clone(),
            2,
        )
        .with_engine(Arc::new(MetadataEngine)),
    );
    handles.extend(workers.spawn(&h.bus, &h.topics, shutdown.clone()).unwrap());

    let response = h
        .orchestrator
        .start_analysis(StartAnalysisRequest::new(
            "img-4",
            vec![EngineSelection::with_params(
                EngineType::Metadata,
                json!({"computeDigest": true}),
            )],
        ))
        .await
        .unwrap();
    let aggregate_id = response.aggregate_task_id;
    let child_id = response.outcome(EngineType::Metadata).unwrap().task_id.unwrap();

    wait_for_status(&h.tasks, aggregate_id, TaskStatus::Completed).await;

    let child = h.tasks.require(child_id).await.unwrap();
    assert_eq!(child.status, TaskStatus::Completed);
    assert_eq!(child.progress, 100);
    let payload = child.result_payload.unwrap();
    assert_eq!(payload["detectedFormat"], "jpeg");
    assert_eq!(payload["extensionMatches"], true);
    assert!(payload["sha256"].is_string());

    let aggregate = h.tasks.require(aggregate_id).await.unwrap();
    assert_eq!(aggregate.progress, 100);

    let fields = h.progress.get_progress(child_id).await.unwrap();
    assert_eq!(fields.get("status").map(String::as_str), Some("COMPLETED"));

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_missing_engine_fails_aggregate() {
    let h = harness().await;
    upload_jpeg(&h, "img-5").await;

    let shutdown = CancellationToken::new();
    let collector = ResultCollector::new(h.tasks.clone(), h.progress.clone());
    let mut handles = collector
        .spawn(&h.bus, &h.topics.results, shutdown.clone())
        .unwrap();
    let workers = Arc::new(
        WorkerPool::new(
            h.tasks.clone(),
            h.uploads.clone(),
            h.objects.clone(),
            h.progress.clone(),
            h.bus.clone(),
            h.topics.results.clone(),
            2,
        )
        .with_engine(Arc::new(MetadataEngine)),
    );
    handles.extend(workers.spawn(&h.bus, &h.topics, shutdown.clone()).unwrap());

    let response = h
        .orchestrator
        .start_analysis(StartAnalysisRequest::new(
            "img-5",
            vec![
                EngineSelection::new(EngineType::Metadata),
                EngineSelection::new(EngineType::TraditionalImage),
            ],
        ))
        .await
        .unwrap();
    let aggregate_id = response.aggregate_task_id;

    wait_for_status(&h.tasks, aggregate_id, TaskStatus::Failed).await;

    let failed = response
        .outcome(EngineType::TraditionalImage)
        .unwrap()
        .task_id
        .unwrap();
    let task = h.tasks.require(failed).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .error_message
        .unwrap()
        .contains("TRADITIONAL_IMAGE"));

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
