use serde::{Deserialize, Serialize};
use sha2::Digest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// Clients of the upload endpoint compute MD5 file ids.
    #[default]
    Md5,
    Sha256,
    Blake3,
}

impl ChecksumType {
    /// Length of the lowercase hex rendering of a digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumType::Md5 => 32,
            ChecksumType::Sha256 | ChecksumType::Blake3 => 64,
        }
    }

    pub fn hasher(&self) -> ContentHasher {
        match self {
            ChecksumType::Md5 => ContentHasher::Md5(md5::Context::new()),
            ChecksumType::Sha256 => ContentHasher::Sha256(sha2::Sha256::new()),
            ChecksumType::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

/// Incremental hasher over the configured algorithm.
pub enum ContentHasher {
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Md5(ctx) => ctx.consume(data),
            ContentHasher::Sha256(hasher) => hasher.update(data),
            ContentHasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            ContentHasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            ContentHasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            ContentHasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub checksum_type: ChecksumType,
    pub expected: Option<String>,
    pub actual: String,
    pub verified_at: i64,
}

impl VerificationResult {
    pub fn success(checksum_type: ChecksumType, checksum: String) -> Self {
        Self {
            success: true,
            checksum_type,
            expected: Some(checksum.clone()),
            actual: checksum,
            verified_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failure(checksum_type: ChecksumType, expected: String, actual: String) -> Self {
        Self {
            success: false,
            checksum_type,
            expected: Some(expected),
            actual,
            verified_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Digest computed but nothing to compare it against.
    pub fn unchecked(checksum_type: ChecksumType, actual: String) -> Self {
        Self {
            success: true,
            checksum_type,
            expected: None,
            actual,
            verified_at: chrono::Utc::now().timestamp(),
        }
    }
}
