use crate::integrity::types::{ChecksumType, VerificationResult};

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Hex digest of a byte slice
    pub fn calculate_checksum(checksum_type: ChecksumType, data: &[u8]) -> String {
        let mut hasher = checksum_type.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }

    /// Normalize a client-supplied digest, or `None` if it is not a well-formed
    /// digest of `checksum_type`.
    pub fn parse_digest(checksum_type: ChecksumType, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.len() == checksum_type.hex_len()
            && trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            Some(trimmed.to_ascii_lowercase())
        } else {
            None
        }
    }

    /// Compare a computed whole-file digest to the upload's file id.
    ///
    /// File ids that are not digests of `checksum_type` are opaque
    /// identifiers and are not compared.
    pub fn verify_file_digest(
        checksum_type: ChecksumType,
        file_id: &str,
        actual: String,
    ) -> VerificationResult {
        match Self::parse_digest(checksum_type, file_id) {
            Some(expected) if expected == actual => {
                VerificationResult::success(checksum_type, actual)
            }
            Some(expected) => VerificationResult::failure(checksum_type, expected, actual),
            None => VerificationResult::unchecked(checksum_type, actual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            IntegrityVerifier::calculate_checksum(ChecksumType::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            IntegrityVerifier::calculate_checksum(ChecksumType::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            IntegrityVerifier::calculate_checksum(ChecksumType::Blake3, b"hello").len(),
            64
        );
    }

    #[test]
    fn test_parse_digest_normalizes_case() {
        assert_eq!(
            IntegrityVerifier::parse_digest(
                ChecksumType::Md5,
                " 5D41402ABC4B2A76B9719D911017C592 "
            ),
            Some("5d41402abc4b2a76b9719d911017c592".to_string())
        );
    }

    #[test]
    fn test_parse_digest_rejects_malformed() {
        assert_eq!(IntegrityVerifier::parse_digest(ChecksumType::Sha256, "abc"), None);
        assert_eq!(
            IntegrityVerifier::parse_digest(
                ChecksumType::Md5,
                "zz41402abc4b2a76b9719d911017c592"
            ),
            None
        );
    }

    #[test]
    fn test_opaque_file_id_is_not_compared() {
        let actual = IntegrityVerifier::calculate_checksum(ChecksumType::Md5, b"data");
        let result =
            IntegrityVerifier::verify_file_digest(ChecksumType::Md5, "abc123def456", actual);
        assert!(result.success);
        assert!(result.expected.is_none());
    }

    #[test]
    fn test_file_digest_mismatch() {
        let actual = IntegrityVerifier::calculate_checksum(ChecksumType::Md5, b"data");
        let result = IntegrityVerifier::verify_file_digest(
            ChecksumType::Md5,
            "5d41402abc4b2a76b9719d911017c592",
            actual,
        );
        assert!(!result.success);
    }
}
