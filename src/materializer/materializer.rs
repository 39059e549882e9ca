use crate::chunk::{ChunkRecord, MediaFile, UploadStatus, UploadStore};
use crate::integrity::{ChecksumType, IntegrityError, IntegrityVerifier};
use crate::materializer::error::{MaterializeError, MaterializeResult};
use crate::materializer::types::{ChunkRetention, MaterializedFile};
use crate::metrics;
use crate::storage::{chunk_key, object_key, ObjectStore, ObjectWriter};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Merges the verified chunks of a completed upload into one object.
///
/// Merges of the same file are serialized. A merge either publishes the
/// whole object under `{fileId}/{fileName}` or publishes nothing, so a
/// crashed or failed merge can simply be run again.
pub struct FileMaterializer {
    store: Arc<UploadStore>,
    objects: Arc<dyn ObjectStore>,
    checksum: ChecksumType,
    retention: ChunkRetention,
    file_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileMaterializer {
    pub fn new(
        store: Arc<UploadStore>,
        objects: Arc<dyn ObjectStore>,
        checksum: ChecksumType,
        retention: ChunkRetention,
    ) -> Self {
        Self {
            store,
            objects,
            checksum,
            retention,
            file_locks: DashMap::new(),
        }
    }

    /// Publish the merged object for a completed upload.
    ///
    /// Already-published uploads are returned as-is.
    pub async fn materialize(&self, file_id: &str) -> MaterializeResult<MaterializedFile> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let file = self.load_completed(file_id).await?;
        if let Some(published) = self.published(&file).await? {
            debug!(file_id, "Merged object already published");
            return Ok(published);
        }

        self.merge(&file).await
    }

    /// Re-run the merge even if an object is already published.
    ///
    /// Requires the chunk blobs to still be staged; the result is
    /// byte-identical to the previous merge.
    pub async fn rebuild(&self, file_id: &str) -> MaterializeResult<MaterializedFile> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let file = self.load_completed(file_id).await?;
        if file.storage_key.is_some() && self.retention == ChunkRetention::DeleteBlobs {
            return Err(MaterializeError::NotReady {
                file_id: file_id.to_string(),
                reason: "chunk blobs were discarded after the previous merge".into(),
            });
        }

        self.merge(&file).await
    }

    /// Finish merges interrupted between the completion transition and
    /// publication. Returns the files that were recovered.
    pub async fn recover_pending_merges(&self) -> MaterializeResult<Vec<MaterializedFile>> {
        let pending = self.store.list_pending_merges().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        info!(count = pending.len(), "Recovering pending merges");
        let mut recovered = Vec::new();
        for file in pending {
            match self.materialize(&file.file_id).await {
                Ok(published) => recovered.push(published),
                Err(e) => {
                    warn!(file_id = %file.file_id, error = %e, "Merge recovery failed");
                }
            }
        }

        Ok(recovered)
    }

    fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_completed(&self, file_id: &str) -> MaterializeResult<MediaFile> {
        let file = self
            .store
            .get_file(file_id)
            .await?
            .ok_or_else(|| MaterializeError::NotFound(file_id.to_string()))?;

        if file.upload_status != UploadStatus::Completed {
            return Err(MaterializeError::NotReady {
                file_id: file_id.to_string(),
                reason: format!("upload status is {}", file.upload_status),
            });
        }
        Ok(file)
    }

    async fn published(&self, file: &MediaFile) -> MaterializeResult<Option<MaterializedFile>> {
        let (Some(key), Some(hash)) = (&file.storage_key, &file.content_hash) else {
            return Ok(None);
        };
        if !self.objects.exists(key).await? {
            warn!(file_id = %file.file_id, key, "Published object is missing, merging again");
            return Ok(None);
        }

        Ok(Some(MaterializedFile {
            file_id: file.file_id.clone(),
            file_name: file.file_name.clone(),
            storage_key: key.clone(),
            content_hash: hash.clone(),
            size: self.objects.size(key).await?,
            media_type: file.media_type,
        }))
    }

    async fn merge(&self, file: &MediaFile) -> MaterializeResult<MaterializedFile> {
        let chunks: Vec<ChunkRecord> = self
            .store
            .list_chunks(&file.file_id)
            .await?
            .into_iter()
            .filter(|c| c.status.is_present() && c.chunk_index < file.total_chunks)
            .collect();

        if chunks.len() != file.total_chunks as usize {
            return Err(MaterializeError::NotReady {
                file_id: file.file_id.clone(),
                reason: format!(
                    "{} of {} chunks present",
                    chunks.len(),
                    file.total_chunks
                ),
            });
        }

        let started = Instant::now();
        let key = object_key(&file.file_id, &file.file_name);
        let mut writer = self.objects.begin_write(&key).await?;

        let content_hash = match self.stream_chunks(file, &chunks, writer.as_mut()).await {
            Ok(hash) => hash,
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(file_id = %file.file_id, error = %abort_err, "Failed to discard staged merge");
                }
                if let MaterializeError::Integrity { source, .. } = &e {
                    self.fail_upload(file, source).await?;
                }
                return Err(e);
            }
        };

        let size = writer.commit().await?;
        self.store
            .set_materialized(&file.file_id, &key, &content_hash)
            .await?;
        self.store.mark_chunks_merged(&file.file_id).await?;

        if self.retention == ChunkRetention::DeleteBlobs {
            for chunk in &chunks {
                let blob = chunk_key(&file.file_id, chunk.chunk_index);
                if let Err(e) = self.objects.delete(&blob).await {
                    warn!(file_id = %file.file_id, chunk_index = chunk.chunk_index, error = %e, "Failed to delete chunk blob");
                }
            }
        }

        metrics::record_merge_completed(size, started.elapsed());
        info!(
            file_id = %file.file_id,
            key = %key,
            size,
            chunks = chunks.len(),
            "Merged object published"
        );

        Ok(MaterializedFile {
            file_id: file.file_id.clone(),
            file_name: file.file_name.clone(),
            storage_key: key,
            content_hash,
            size,
            media_type: file.media_type,
        })
    }

    /// Copy chunks in index order into `writer`, re-checking each one and
    /// the whole file. Returns the whole-file digest.
    async fn stream_chunks(
        &self,
        file: &MediaFile,
        chunks: &[ChunkRecord],
        writer: &mut dyn ObjectWriter,
    ) -> MaterializeResult<String> {
        let integrity = |source| MaterializeError::Integrity {
            file_id: file.file_id.clone(),
            source,
        };

        let mut hasher = self.checksum.hasher();
        let mut written: u64 = 0;

        for chunk in chunks {
            let data = self
                .objects
                .get(&chunk_key(&file.file_id, chunk.chunk_index))
                .await?;

            if data.len() as u64 != chunk.chunk_size {
                return Err(integrity(IntegrityError::SizeMismatch {
                    expected: chunk.chunk_size,
                    actual: data.len() as u64,
                }));
            }
            let actual = IntegrityVerifier::calculate_checksum(self.checksum, &data);
            if actual != chunk.chunk_hash {
                return Err(integrity(IntegrityError::ChecksumMismatch {
                    expected: chunk.chunk_hash.clone(),
                    actual,
                }));
            }

            writer.write(&data).await?;
            hasher.update(&data);
            written += data.len() as u64;
        }

        if written != file.total_size {
            return Err(integrity(IntegrityError::SizeMismatch {
                expected: file.total_size,
                actual: written,
            }));
        }

        let verification =
            IntegrityVerifier::verify_file_digest(self.checksum, &file.file_id, hasher.finalize_hex());
        if !verification.success {
            return Err(integrity(IntegrityError::ChecksumMismatch {
                expected: verification.expected.unwrap_or_default(),
                actual: verification.actual,
            }));
        }

        Ok(verification.actual)
    }

    async fn fail_upload(&self, file: &MediaFile, cause: &IntegrityError) -> MaterializeResult<()> {
        metrics::record_integrity_failure("file");
        error!(file_id = %file.file_id, error = %cause, "Merged object failed verification");

        let message = format!("integrity check failed: {cause}");
        self.store
            .transition_status(
                &file.file_id,
                &UploadStatus::sources_of(UploadStatus::Failed),
                UploadStatus::Failed,
                Some(&message),
            )
            .await?;
        Ok(())
    }
}
