use async_trait::async_trait;
use bytes::Bytes;

use super::error::{StorageError, StorageResult};

/// Object storage seam (local filesystem in this crate, S3/MinIO in a
/// deployment).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Delete an object; deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// Start a staged write. Nothing is visible under `key` until
    /// [`ObjectWriter::commit`] succeeds.
    async fn begin_write(&self, key: &str) -> StorageResult<Box<dyn ObjectWriter>>;

    /// Location handed to out-of-process consumers.
    fn url_for(&self, key: &str) -> String;
}

#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Publish the staged bytes under the key, replacing any existing object.
    /// Returns the object size.
    async fn commit(self: Box<Self>) -> StorageResult<u64>;

    /// Discard the staged bytes.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Key of the merged object for an upload.
pub fn object_key(file_id: &str, file_name: &str) -> String {
    format!("{file_id}/{file_name}")
}

/// Key of one staged chunk.
pub fn chunk_key(file_id: &str, chunk_index: u32) -> String {
    format!("{file_id}/chunks/{file_id}_{chunk_index}")
}

/// Reject keys that could escape the bucket.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
