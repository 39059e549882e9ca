//! In-memory object store (for testing and single-process deployments).

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

use super::backend::{validate_key, ObjectStore, ObjectWriter};
use super::error::{StorageError, StorageResult};

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Keys currently stored under `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        self.objects
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn begin_write(&self, key: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        validate_key(key)?;
        Ok(Box::new(MemoryObjectWriter {
            objects: self.objects.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn url_for(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

struct MemoryObjectWriter {
    objects: Arc<DashMap<String, Bytes>>,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemoryObjectWriter {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<u64> {
        let size = self.buffer.len() as u64;
        self.objects.insert(self.key, Bytes::from(self.buffer));
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
