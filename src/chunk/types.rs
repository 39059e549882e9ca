use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Longest accepted file identifier.
pub const MAX_FILE_ID_LEN: usize = 128;

/// Lifecycle of one received chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    /// Record written, bytes not yet staged.
    Uploaded,
    Verified,
    Merged,
    /// Hash mismatch; excluded from completion until resubmitted.
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Uploaded => "UPLOADED",
            ChunkStatus::Verified => "VERIFIED",
            ChunkStatus::Merged => "MERGED",
            ChunkStatus::Failed => "FAILED",
        }
    }

    /// Counts towards upload completeness
    pub fn is_present(&self) -> bool {
        matches!(self, ChunkStatus::Verified | ChunkStatus::Merged)
    }

    /// Transition table for a chunk record. `None` is "no record yet".
    pub fn can_transition(from: Option<ChunkStatus>, to: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (from, to),
            (None, Uploaded)
                | (None, Failed)
                | (Some(Uploaded), Uploaded)
                | (Some(Uploaded), Verified)
                | (Some(Uploaded), Failed)
                | (Some(Failed), Uploaded)
                | (Some(Failed), Failed)
                | (Some(Verified), Verified)
                | (Some(Verified), Merged)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADED" => Ok(ChunkStatus::Uploaded),
            "VERIFIED" => Ok(ChunkStatus::Verified),
            "MERGED" => Ok(ChunkStatus::Merged),
            "FAILED" => Ok(ChunkStatus::Failed),
            other => Err(format!("unknown chunk status: {other}")),
        }
    }
}

/// Lifecycle of an upload as a whole.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Paused => "PAUSED",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
            UploadStatus::Cancelled => "CANCELLED",
        }
    }

    /// Transition table for uploads.
    ///
    /// COMPLETED is entered only from UPLOADING and is never left except for
    /// FAILED when the merged object fails verification. FAILED and CANCELLED
    /// uploads restart from scratch.
    pub fn can_transition(from: UploadStatus, to: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (from, to),
            (Uploading, Completed)
                | (Uploading, Paused)
                | (Uploading, Cancelled)
                | (Paused, Uploading)
                | (Paused, Cancelled)
                | (Completed, Failed)
                | (Failed, Uploading)
                | (Cancelled, Uploading)
        )
    }

    /// Statuses that may move to `to`.
    pub fn sources_of(to: UploadStatus) -> Vec<UploadStatus> {
        use UploadStatus::*;
        [Uploading, Paused, Completed, Failed, Cancelled]
            .into_iter()
            .filter(|from| Self::can_transition(*from, to))
            .collect()
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(UploadStatus::Uploading),
            "PAUSED" => Ok(UploadStatus::Paused),
            "COMPLETED" => Ok(UploadStatus::Completed),
            "FAILED" => Ok(UploadStatus::Failed),
            "CANCELLED" => Ok(UploadStatus::Cancelled),
            other => Err(format!("unknown upload status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Image,
    Video,
    Unknown,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "heic",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "3gp",
];

impl MediaType {
    /// Classify by file-name extension (case-insensitive).
    pub fn from_file_name(file_name: &str) -> Self {
        let ext = match file_name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return MediaType::Unknown,
        };

        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaType::Video
        } else {
            MediaType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "IMAGE",
            MediaType::Video => "VIDEO",
            MediaType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMAGE" => Ok(MediaType::Image),
            "VIDEO" => Ok(MediaType::Video),
            "UNKNOWN" => Ok(MediaType::Unknown),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub file_id: String,
    pub chunk_index: u32,
    pub chunk_size: u64,
    /// Digest computed over the received bytes
    pub chunk_hash: String,
    pub status: ChunkStatus,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub file_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub uploaded_chunk_count: u32,
    pub upload_status: UploadStatus,
    pub media_type: MediaType,
    /// Set once the merged object has been published
    pub storage_key: Option<String>,
    pub content_hash: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MediaFile {
    /// Completed and published; the only state analysis may start from.
    pub fn is_materialized(&self) -> bool {
        self.upload_status == UploadStatus::Completed && self.storage_key.is_some()
    }
}

/// One chunk as received from a client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub data: Bytes,
    pub chunk_hash: Option<String>,
}

/// Completeness report returned after every chunk and by progress queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub file_id: String,
    pub file_name: String,
    pub upload_status: UploadStatus,
    pub media_type: MediaType,
    pub uploaded_chunk_count: u32,
    pub total_chunks: u32,
    pub missing_chunk_indices: Vec<u32>,
    pub progress_percent: f64,
    pub materialized: bool,
}

impl UploadProgress {
    pub fn from_records(file: &MediaFile, chunks: &[ChunkRecord]) -> Self {
        let (uploaded, missing) = if file.upload_status == UploadStatus::Completed {
            (file.total_chunks, Vec::new())
        } else {
            let present: BTreeSet<u32> = chunks
                .iter()
                .filter(|c| c.status.is_present() && c.chunk_index < file.total_chunks)
                .map(|c| c.chunk_index)
                .collect();
            let missing = (0..file.total_chunks)
                .filter(|i| !present.contains(i))
                .collect();
            (present.len() as u32, missing)
        };

        Self {
            file_id: file.file_id.clone(),
            file_name: file.file_name.clone(),
            upload_status: file.upload_status,
            media_type: file.media_type,
            uploaded_chunk_count: uploaded,
            total_chunks: file.total_chunks,
            missing_chunk_indices: missing,
            progress_percent: progress_percent(uploaded, file.total_chunks),
            materialized: file.is_materialized(),
        }
    }
}

/// Percentage rounded to two decimals.
pub fn progress_percent(uploaded: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = uploaded as f64 * 100.0 / total as f64;
    (raw * 100.0).round() / 100.0
}

/// File ids are used in object keys, so only `[A-Za-z0-9_-]` is allowed.
pub fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id.len() <= MAX_FILE_ID_LEN
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Reduce a client-supplied file name to a single safe path segment.
pub fn sanitize_file_name(file_name: &str) -> Option<String> {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(status: UploadStatus, total: u32) -> MediaFile {
        MediaFile {
            file_id: "abc".into(),
            file_name: "a.png".into(),
            total_chunks: total,
            total_size: 100,
            uploaded_chunk_count: 0,
            upload_status: status,
            media_type: MediaType::Image,
            storage_key: None,
            content_hash: None,
            error_message: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn chunk(index: u32, status: ChunkStatus) -> ChunkRecord {
        ChunkRecord {
            file_id: "abc".into(),
            chunk_index: index,
            chunk_size: 10,
            chunk_hash: String::new(),
            status,
            updated_at: 0,
        }
    }

    #[test]
    fn test_media_type_detection() {
        assert_eq!(MediaType::from_file_name("scene.JPG"), MediaType::Image);
        assert_eq!(MediaType::from_file_name("clip.mov"), MediaType::Video);
        assert_eq!(MediaType::from_file_name("notes.txt"), MediaType::Unknown);
        assert_eq!(MediaType::from_file_name("noextension"), MediaType::Unknown);
    }

    #[test]
    fn test_upload_transitions() {
        assert!(UploadStatus::can_transition(
            UploadStatus::Uploading,
            UploadStatus::Completed
        ));
        assert!(!UploadStatus::can_transition(
            UploadStatus::Completed,
            UploadStatus::Uploading
        ));
        assert!(!UploadStatus::can_transition(
            UploadStatus::Paused,
            UploadStatus::Completed
        ));
        assert_eq!(
            UploadStatus::sources_of(UploadStatus::Cancelled),
            vec![UploadStatus::Uploading, UploadStatus::Paused]
        );
    }

    #[test]
    fn test_chunk_transitions() {
        assert!(ChunkStatus::can_transition(None, ChunkStatus::Uploaded));
        assert!(ChunkStatus::can_transition(
            Some(ChunkStatus::Failed),
            ChunkStatus::Uploaded
        ));
        assert!(!ChunkStatus::can_transition(
            Some(ChunkStatus::Merged),
            ChunkStatus::Verified
        ));
        assert!(!ChunkStatus::can_transition(
            Some(ChunkStatus::Verified),
            ChunkStatus::Failed
        ));
    }

    #[test]
    fn test_progress_ignores_failed_chunks() {
        let progress = UploadProgress::from_records(
            &file(UploadStatus::Uploading, 4),
            &[
                chunk(0, ChunkStatus::Verified),
                chunk(1, ChunkStatus::Failed),
                chunk(3, ChunkStatus::Uploaded),
            ],
        );
        assert_eq!(progress.uploaded_chunk_count, 1);
        assert_eq!(progress.missing_chunk_indices, vec![1, 2, 3]);
        assert_eq!(progress.progress_percent, 25.0);
    }

    #[test]
    fn test_completed_reports_full() {
        let progress = UploadProgress::from_records(&file(UploadStatus::Completed, 3), &[]);
        assert_eq!(progress.uploaded_chunk_count, 3);
        assert!(progress.missing_chunk_indices.is_empty());
        assert_eq!(progress.progress_percent, 100.0);
    }

    #[test]
    fn test_progress_percent_rounding() {
        assert_eq!(progress_percent(2, 3), 66.67);
        assert_eq!(progress_percent(0, 0), 0.0);
    }

    #[test]
    fn test_file_id_and_name_rules() {
        assert!(is_valid_file_id("abc123def456"));
        assert!(is_valid_file_id("a-b_c"));
        assert!(!is_valid_file_id("../x"));
        assert!(!is_valid_file_id(""));
        assert!(!is_valid_file_id(&"a".repeat(129)));

        assert_eq!(sanitize_file_name("dir/sub/photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(sanitize_file_name("C:\\x\\clip.mp4").as_deref(), Some("clip.mp4"));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("  "), None);
    }
}
