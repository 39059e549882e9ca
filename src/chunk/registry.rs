use crate::chunk::error::{ChunkError, ChunkResult};
use crate::chunk::store::UploadStore;
use crate::chunk::types::{
    is_valid_file_id, sanitize_file_name, ChunkRecord, ChunkStatus, ChunkUpload, MediaFile,
    MediaType, UploadProgress, UploadStatus,
};
use crate::config::UploadConfig;
use crate::integrity::IntegrityVerifier;
use crate::materializer::{FileMaterializer, MaterializeError, MaterializedFile};
use crate::metrics;
use crate::storage::{chunk_key, ObjectStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives chunks, tracks completeness per file id and hands complete
/// uploads to the materializer exactly once.
pub struct ChunkRegistry {
    store: Arc<UploadStore>,
    objects: Arc<dyn ObjectStore>,
    materializer: Arc<FileMaterializer>,
    config: UploadConfig,
}

impl ChunkRegistry {
    pub fn new(
        store: Arc<UploadStore>,
        objects: Arc<dyn ObjectStore>,
        materializer: Arc<FileMaterializer>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            objects,
            materializer,
            config,
        }
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.store
    }

    /// Accept one chunk and report upload completeness.
    ///
    /// The call that completes the upload also runs the merge. An integrity
    /// failure of the merged object is returned as an error; a storage
    /// failure leaves the upload completed but unpublished (see
    /// [`ChunkRegistry::retry_merge`]).
    pub async fn accept_chunk(&self, upload: ChunkUpload) -> ChunkResult<UploadProgress> {
        let file_name = self.validate(&upload)?;

        let file = match self.store.get_file(&upload.file_id).await? {
            Some(file) => file,
            None => {
                let media_type = MediaType::from_file_name(&file_name);
                let file = self
                    .store
                    .create_file_if_absent(
                        &upload.file_id,
                        &file_name,
                        upload.total_chunks,
                        upload.total_size,
                        media_type,
                    )
                    .await?;
                info!(
                    file_id = %upload.file_id,
                    file_name = %file.file_name,
                    total_chunks = file.total_chunks,
                    media_type = %file.media_type,
                    "Upload started"
                );
                file
            }
        };

        if file.upload_status == UploadStatus::Completed {
            debug!(file_id = %file.file_id, chunk_index = upload.chunk_index, "Upload already complete");
            return self.progress_of(&file).await;
        }
        Self::check_consistent(&file, &upload)?;
        Self::check_accepting(&file)?;

        let existing = self
            .store
            .get_chunk(&upload.file_id, upload.chunk_index)
            .await?;
        let previous = existing.as_ref().map(|c| c.status);
        let actual = IntegrityVerifier::calculate_checksum(self.config.checksum, &upload.data);

        if let Some(claimed) = upload.chunk_hash.as_deref().filter(|h| !h.trim().is_empty()) {
            let expected = IntegrityVerifier::parse_digest(self.config.checksum, claimed)
                .unwrap_or_else(|| claimed.trim().to_string());
            if expected != actual {
                return Err(self
                    .reject_chunk(&upload, previous, expected, actual)
                    .await?);
            }
        }

        // Only first receipts and resubmissions of failed chunks pass through
        // UPLOADED; a verified chunk is overwritten in place.
        if previous != Some(ChunkStatus::Verified) {
            self.write_chunk(&upload, &actual, previous, ChunkStatus::Uploaded)
                .await?;
        }
        self.objects
            .put(&chunk_key(&upload.file_id, upload.chunk_index), upload.data.clone())
            .await?;
        let staged = match previous {
            Some(ChunkStatus::Verified) => ChunkStatus::Verified,
            _ => ChunkStatus::Uploaded,
        };
        self.write_chunk(&upload, &actual, Some(staged), ChunkStatus::Verified)
            .await?;
        metrics::record_chunk_accepted(upload.data.len());

        let uploaded = self.store.refresh_uploaded_count(&upload.file_id).await?;
        debug!(
            file_id = %upload.file_id,
            chunk_index = upload.chunk_index,
            uploaded,
            total = file.total_chunks,
            "Chunk verified"
        );

        if uploaded == file.total_chunks && self.store.try_complete(&upload.file_id).await? {
            info!(file_id = %upload.file_id, "All chunks received, merging");
            metrics::record_upload_completed();
            self.run_merge(&upload.file_id).await?;
        }

        self.get_upload_progress(&upload.file_id).await
    }

    pub async fn get_upload_progress(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        let file = self.require_file(file_id).await?;
        self.progress_of(&file).await
    }

    pub async fn get_file(&self, file_id: &str) -> ChunkResult<MediaFile> {
        self.require_file(file_id).await
    }

    pub async fn pause_upload(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        self.transition(file_id, &UploadStatus::sources_of(UploadStatus::Paused), UploadStatus::Paused)
            .await?;
        info!(file_id, "Upload paused");
        self.get_upload_progress(file_id).await
    }

    pub async fn resume_upload(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        self.transition(file_id, &[UploadStatus::Paused], UploadStatus::Uploading)
            .await?;
        info!(file_id, "Upload resumed");
        self.get_upload_progress(file_id).await
    }

    /// Cancel an in-flight upload and discard its staged chunks.
    pub async fn cancel_upload(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        self.transition(
            file_id,
            &UploadStatus::sources_of(UploadStatus::Cancelled),
            UploadStatus::Cancelled,
        )
        .await?;
        let removed = self.discard_chunks(file_id).await?;
        info!(file_id, removed, "Upload cancelled");
        self.get_upload_progress(file_id).await
    }

    /// Drop FAILED chunk records so their indices are reported missing again.
    pub async fn retry_failed_chunks(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        let file = self.require_file(file_id).await?;
        Self::check_accepting(&file)?;

        let cleared = self
            .store
            .delete_chunks_with_status(file_id, ChunkStatus::Failed)
            .await?;
        for index in &cleared {
            self.objects.delete(&chunk_key(file_id, *index)).await?;
        }
        info!(file_id, cleared = cleared.len(), "Failed chunks cleared for resubmission");
        self.get_upload_progress(file_id).await
    }

    /// Start a FAILED or CANCELLED upload over from its first chunk.
    pub async fn restart_upload(&self, file_id: &str) -> ChunkResult<UploadProgress> {
        const RESTARTABLE: [UploadStatus; 2] = [UploadStatus::Failed, UploadStatus::Cancelled];

        let file = self.require_file(file_id).await?;
        if !RESTARTABLE.contains(&file.upload_status) {
            return Err(ChunkError::Conflict(format!(
                "cannot restart upload {file_id} in status {}",
                file.upload_status
            )));
        }

        self.discard_chunks(file_id).await?;
        self.store.reset_upload(file_id).await?;
        self.transition(file_id, &RESTARTABLE, UploadStatus::Uploading)
            .await?;
        info!(file_id, "Upload restarted");
        self.get_upload_progress(file_id).await
    }

    /// Publish the merged object of a completed upload whose merge did not
    /// finish.
    pub async fn retry_merge(&self, file_id: &str) -> ChunkResult<MaterializedFile> {
        Ok(self.materializer.materialize(file_id).await?)
    }

    fn validate(&self, upload: &ChunkUpload) -> ChunkResult<String> {
        if !is_valid_file_id(&upload.file_id) {
            return Err(ChunkError::Validation(format!(
                "file id must be 1-128 characters of [A-Za-z0-9_-], got {:?}",
                upload.file_id
            )));
        }
        let file_name = sanitize_file_name(&upload.file_name).ok_or_else(|| {
            ChunkError::Validation(format!("invalid file name {:?}", upload.file_name))
        })?;
        if upload.total_chunks == 0 {
            return Err(ChunkError::Validation("totalChunks must be positive".into()));
        }
        if upload.chunk_index >= upload.total_chunks {
            return Err(ChunkError::Validation(format!(
                "chunk index {} out of range for {} chunks",
                upload.chunk_index, upload.total_chunks
            )));
        }
        if upload.data.is_empty() {
            return Err(ChunkError::Validation("chunk payload is empty".into()));
        }
        if upload.data.len() > self.config.max_chunk_size {
            return Err(ChunkError::Validation(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                upload.data.len(),
                self.config.max_chunk_size
            )));
        }
        if upload.data.len() as u64 > upload.total_size {
            return Err(ChunkError::Validation(format!(
                "chunk of {} bytes is larger than the declared file size {}",
                upload.data.len(),
                upload.total_size
            )));
        }
        Ok(file_name)
    }

    fn check_consistent(file: &MediaFile, upload: &ChunkUpload) -> ChunkResult<()> {
        if file.total_chunks != upload.total_chunks {
            return Err(ChunkError::Validation(format!(
                "totalChunks {} conflicts with {} recorded for {}",
                upload.total_chunks, file.total_chunks, file.file_id
            )));
        }
        if file.total_size != upload.total_size {
            return Err(ChunkError::Validation(format!(
                "totalSize {} conflicts with {} recorded for {}",
                upload.total_size, file.total_size, file.file_id
            )));
        }
        Ok(())
    }

    fn check_accepting(file: &MediaFile) -> ChunkResult<()> {
        match file.upload_status {
            UploadStatus::Uploading => Ok(()),
            UploadStatus::Paused => Err(ChunkError::Conflict(format!(
                "upload {} is paused",
                file.file_id
            ))),
            status => Err(ChunkError::Conflict(format!(
                "upload {} is {}; restart it to upload again",
                file.file_id, status
            ))),
        }
    }

    async fn reject_chunk(
        &self,
        upload: &ChunkUpload,
        previous: Option<ChunkStatus>,
        expected: String,
        actual: String,
    ) -> ChunkResult<ChunkError> {
        metrics::record_chunk_rejected("hash_mismatch");
        warn!(
            file_id = %upload.file_id,
            chunk_index = upload.chunk_index,
            expected = %expected,
            actual = %actual,
            "Chunk hash mismatch"
        );

        // A good copy already on record stays; anything else is marked FAILED
        if ChunkStatus::can_transition(previous, ChunkStatus::Failed) {
            self.write_chunk(upload, &actual, previous, ChunkStatus::Failed)
                .await?;
            self.store.refresh_uploaded_count(&upload.file_id).await?;
        }

        Ok(ChunkError::ChecksumMismatch {
            chunk_index: upload.chunk_index,
            expected,
            actual,
        })
    }

    async fn write_chunk(
        &self,
        upload: &ChunkUpload,
        chunk_hash: &str,
        from: Option<ChunkStatus>,
        to: ChunkStatus,
    ) -> ChunkResult<()> {
        if !ChunkStatus::can_transition(from, to) {
            return Err(ChunkError::Conflict(format!(
                "chunk {} of {} cannot move from {:?} to {}",
                upload.chunk_index, upload.file_id, from, to
            )));
        }

        self.store
            .upsert_chunk(&ChunkRecord {
                file_id: upload.file_id.clone(),
                chunk_index: upload.chunk_index,
                chunk_size: upload.data.len() as u64,
                chunk_hash: chunk_hash.to_string(),
                status: to,
                updated_at: chrono::Utc::now().timestamp(),
            })
            .await
    }

    async fn run_merge(&self, file_id: &str) -> ChunkResult<()> {
        match self.materializer.materialize(file_id).await {
            Ok(_) => Ok(()),
            Err(e @ MaterializeError::Integrity { .. }) => Err(e.into()),
            Err(e) => {
                warn!(file_id, error = %e, "Merge did not complete; upload left pending");
                Ok(())
            }
        }
    }

    async fn transition(
        &self,
        file_id: &str,
        from: &[UploadStatus],
        to: UploadStatus,
    ) -> ChunkResult<()> {
        let file = self.require_file(file_id).await?;
        debug_assert!(from.iter().all(|s| UploadStatus::can_transition(*s, to)));

        if !from.contains(&file.upload_status)
            || !self.store.transition_status(file_id, from, to, None).await?
        {
            return Err(ChunkError::Conflict(format!(
                "upload {file_id} cannot move from {} to {to}",
                file.upload_status
            )));
        }
        Ok(())
    }

    async fn discard_chunks(&self, file_id: &str) -> ChunkResult<usize> {
        let removed = self.store.delete_all_chunks(file_id).await?;
        for index in &removed {
            self.objects.delete(&chunk_key(file_id, *index)).await?;
        }
        self.store.refresh_uploaded_count(file_id).await?;
        Ok(removed.len())
    }

    async fn require_file(&self, file_id: &str) -> ChunkResult<MediaFile> {
        self.store
            .get_file(file_id)
            .await?
            .ok_or_else(|| ChunkError::NotFound(file_id.to_string()))
    }

    async fn progress_of(&self, file: &MediaFile) -> ChunkResult<UploadProgress> {
        let chunks = self.store.list_chunks(&file.file_id).await?;
        Ok(UploadProgress::from_records(file, &chunks))
    }
}
