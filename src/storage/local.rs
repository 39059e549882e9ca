//! Local filesystem object store.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::backend::{validate_key, ObjectStore, ObjectWriter};
use super::error::{StorageError, StorageResult};

/// Stores objects as files under `{root}/{bucket}/{key}`.
///
/// Staged writes go to a uniquely named `.partial` sibling and are renamed
/// into place on commit, so readers never observe a half-written object.
pub struct LocalObjectStore {
    base_path: PathBuf,
    bucket: String,
    public_base_url: String,
}

impl LocalObjectStore {
    pub async fn new(
        root: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> StorageResult<Self> {
        let bucket = bucket.into();
        let base_path = root.into().join(&bucket);
        fs::create_dir_all(&base_path).await?;

        Ok(Self {
            base_path,
            bucket,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let mut writer = self.begin_write(key).await?;
        writer.write(&data).await?;
        writer.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path).await.map_err(|e| Self::not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(metadata.len())
    }

    async fn begin_write(&self, key: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        let final_path = self.key_path(key)?;
        Self::ensure_parent(&final_path).await?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging_path =
            final_path.with_file_name(format!(".{file_name}.{}.partial", uuid::Uuid::new_v4()));
        let file = fs::File::create(&staging_path).await?;

        Ok(Box::new(LocalObjectWriter {
            file,
            staging_path,
            final_path,
            written: 0,
        }))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, self.bucket, key)
    }
}

struct LocalObjectWriter {
    file: fs::File,
    staging_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.staging_path, &self.final_path).await?;
        Ok(self.written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        match fs::remove_file(&self.staging_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_store(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), "forensic-media", "http://localhost:9000/")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir).await;

        store
            .put("abc/chunks/abc_0", Bytes::from_static(b"chunk"))
            .await
            .unwrap();
        assert!(store.exists("abc/chunks/abc_0").await.unwrap());
        assert_eq!(store.size("abc/chunks/abc_0").await.unwrap(), 5);
        assert_eq!(
            store.get("abc/chunks/abc_0").await.unwrap(),
            Bytes::from_static(b"chunk")
        );

        store.delete("abc/chunks/abc_0").await.unwrap();
        assert!(!store.exists("abc/chunks/abc_0").await.unwrap());
        // Deleting twice is fine
        store.delete("abc/chunks/abc_0").await.unwrap();
    }

    #[tokio::test]
    async fn test_staged_write_invisible_until_commit() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir).await;

        let mut writer = store.begin_write("abc/photo.jpg").await.unwrap();
        writer.write(b"part one ").await.unwrap();
        writer.write(b"part two").await.unwrap();
        assert!(!store.exists("abc/photo.jpg").await.unwrap());

        let size = writer.commit().await.unwrap();
        assert_eq!(size, 17);
        assert_eq!(
            store.get("abc/photo.jpg").await.unwrap(),
            Bytes::from_static(b"part one part two")
        );
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir).await;

        let mut writer = store.begin_write("abc/photo.jpg").await.unwrap();
        writer.write(b"garbage").await.unwrap();
        writer.abort().await.unwrap();

        assert!(!store.exists("abc/photo.jpg").await.unwrap());
        let mut entries = fs::read_dir(temp_dir.path().join("forensic-media/abc"))
            .await
            .unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir).await;

        assert!(matches!(
            store.get("nope/missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_url_and_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir).await;

        assert_eq!(
            store.url_for("abc/photo.jpg"),
            "http://localhost:9000/forensic-media/abc/photo.jpg"
        );
        assert!(matches!(
            store.put("../escape", Bytes::new()).await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
