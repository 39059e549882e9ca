use crate::chunk::error::{ChunkError, ChunkResult};
use crate::chunk::types::{ChunkRecord, ChunkStatus, MediaFile, MediaType, UploadStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Durable upload state: one `media_files` row per file id and one
/// `chunk_records` row per (file id, chunk index).
pub struct UploadStore {
    pool: SqlitePool,
}

impl UploadStore {
    /// Create the store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> ChunkResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_files (
                file_id TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                total_chunks INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                uploaded_chunk_count INTEGER NOT NULL DEFAULT 0,
                upload_status TEXT NOT NULL,
                media_type TEXT NOT NULL,
                storage_key TEXT,
                content_hash TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_records (
                file_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                chunk_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (file_id, chunk_index)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files(upload_status)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get_file(&self, file_id: &str) -> ChunkResult<Option<MediaFile>> {
        let row = sqlx::query("SELECT * FROM media_files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| file_from_row(&r)).transpose()
    }

    /// Insert the file row unless one already exists; returns the stored row.
    pub async fn create_file_if_absent(
        &self,
        file_id: &str,
        file_name: &str,
        total_chunks: u32,
        total_size: u64,
        media_type: MediaType,
    ) -> ChunkResult<MediaFile> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO media_files
            (file_id, file_name, total_chunks, total_size, uploaded_chunk_count,
             upload_status, media_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(file_id)
        .bind(file_name)
        .bind(total_chunks as i64)
        .bind(total_size as i64)
        .bind(UploadStatus::Uploading.as_str())
        .bind(media_type.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_file(file_id)
            .await?
            .ok_or_else(|| ChunkError::NotFound(file_id.to_string()))
    }

    /// Write a chunk record; last write per (file id, index) wins, except that
    /// merged chunks are never overwritten.
    pub async fn upsert_chunk(&self, record: &ChunkRecord) -> ChunkResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_records
            (file_id, chunk_index, chunk_size, chunk_hash, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id, chunk_index) DO UPDATE SET
                chunk_size = excluded.chunk_size,
                chunk_hash = excluded.chunk_hash,
                status = excluded.status,
                updated_at = excluded.updated_at
            WHERE chunk_records.status != 'MERGED'
            "#,
        )
        .bind(&record.file_id)
        .bind(record.chunk_index as i64)
        .bind(record.chunk_size as i64)
        .bind(&record.chunk_hash)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_chunk(
        &self,
        file_id: &str,
        chunk_index: u32,
    ) -> ChunkResult<Option<ChunkRecord>> {
        let row = sqlx::query("SELECT * FROM chunk_records WHERE file_id = ? AND chunk_index = ?")
            .bind(file_id)
            .bind(chunk_index as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| chunk_from_row(&r)).transpose()
    }

    /// All chunk records for a file, ordered by index
    pub async fn list_chunks(&self, file_id: &str) -> ChunkResult<Vec<ChunkRecord>> {
        let rows =
            sqlx::query("SELECT * FROM chunk_records WHERE file_id = ? ORDER BY chunk_index ASC")
                .bind(file_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Recompute and persist the number of present chunks below `total_chunks`.
    pub async fn refresh_uploaded_count(&self, file_id: &str) -> ChunkResult<u32> {
        sqlx::query(
            r#"
            UPDATE media_files SET
                uploaded_chunk_count = (
                    SELECT COUNT(*) FROM chunk_records
                    WHERE chunk_records.file_id = media_files.file_id
                      AND chunk_records.chunk_index < media_files.total_chunks
                      AND chunk_records.status IN ('VERIFIED', 'MERGED')
                ),
                updated_at = ?
            WHERE file_id = ?
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT uploaded_chunk_count FROM media_files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| ChunkError::NotFound(file_id.to_string()))?;

        Ok(count as u32)
    }

    /// Single-winner UPLOADING -> COMPLETED transition.
    ///
    /// The update only applies while every index is present, so exactly one
    /// caller observes `true` per upload.
    pub async fn try_complete(&self, file_id: &str) -> ChunkResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_files SET upload_status = 'COMPLETED', updated_at = ?
            WHERE file_id = ?
              AND upload_status = 'UPLOADING'
              AND total_chunks = (
                  SELECT COUNT(*) FROM chunk_records
                  WHERE chunk_records.file_id = media_files.file_id
                    AND chunk_records.chunk_index < media_files.total_chunks
                    AND chunk_records.status IN ('VERIFIED', 'MERGED')
              )
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set on upload status. Returns false if the row was not in
    /// one of `from`.
    pub async fn transition_status(
        &self,
        file_id: &str,
        from: &[UploadStatus],
        to: UploadStatus,
        error_message: Option<&str>,
    ) -> ChunkResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE media_files SET upload_status = ?, error_message = ?, updated_at = ? \
             WHERE file_id = ? AND upload_status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error_message)
            .bind(chrono::Utc::now().timestamp())
            .bind(file_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the published object for a completed upload.
    pub async fn set_materialized(
        &self,
        file_id: &str,
        storage_key: &str,
        content_hash: &str,
    ) -> ChunkResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_files SET storage_key = ?, content_hash = ?, updated_at = ?
            WHERE file_id = ? AND upload_status = 'COMPLETED'
            "#,
        )
        .bind(storage_key)
        .bind(content_hash)
        .bind(chrono::Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_chunks_merged(&self, file_id: &str) -> ChunkResult<u64> {
        let result = sqlx::query(
            "UPDATE chunk_records SET status = 'MERGED', updated_at = ? \
             WHERE file_id = ? AND status = 'VERIFIED'",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_chunks_with_status(
        &self,
        file_id: &str,
        status: ChunkStatus,
    ) -> ChunkResult<Vec<u32>> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "DELETE FROM chunk_records WHERE file_id = ? AND status = ? RETURNING chunk_index",
        )
        .bind(file_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(indices.into_iter().map(|i| i as u32).collect())
    }

    pub async fn delete_all_chunks(&self, file_id: &str) -> ChunkResult<Vec<u32>> {
        let indices: Vec<i64> =
            sqlx::query_scalar("DELETE FROM chunk_records WHERE file_id = ? RETURNING chunk_index")
                .bind(file_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(indices.into_iter().map(|i| i as u32).collect())
    }

    /// Clear merge results and counters ahead of a full re-upload.
    pub async fn reset_upload(&self, file_id: &str) -> ChunkResult<()> {
        sqlx::query(
            r#"
            UPDATE media_files SET
                uploaded_chunk_count = 0,
                storage_key = NULL,
                content_hash = NULL,
                error_message = NULL,
                updated_at = ?
            WHERE file_id = ?
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Completed uploads whose merged object was never published.
    pub async fn list_pending_merges(&self) -> ChunkResult<Vec<MediaFile>> {
        let rows = sqlx::query(
            "SELECT * FROM media_files WHERE upload_status = 'COMPLETED' AND storage_key IS NULL \
             ORDER BY updated_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(file_from_row).collect()
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(row: &SqliteRow, column: &str) -> ChunkResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(ChunkError::DatabaseError)
}

fn file_from_row(row: &SqliteRow) -> ChunkResult<MediaFile> {
    Ok(MediaFile {
        file_id: row.try_get("file_id")?,
        file_name: row.try_get("file_name")?,
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u32,
        total_size: row.try_get::<i64, _>("total_size")? as u64,
        uploaded_chunk_count: row.try_get::<i64, _>("uploaded_chunk_count")? as u32,
        upload_status: parse_column(row, "upload_status")?,
        media_type: parse_column(row, "media_type")?,
        storage_key: row.try_get("storage_key")?,
        content_hash: row.try_get("content_hash")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> ChunkResult<ChunkRecord> {
    Ok(ChunkRecord {
        file_id: row.try_get("file_id")?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as u32,
        chunk_size: row.try_get::<i64, _>("chunk_size")? as u64,
        chunk_hash: row.try_get("chunk_hash")?,
        status: parse_column(row, "status")?,
        updated_at: row.try_get("updated_at")?,
    })
}
