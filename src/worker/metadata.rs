use crate::chunk::MediaType;
use crate::dispatch::{EngineParams, EngineType};
use crate::integrity::{ChecksumType, IntegrityVerifier};
use crate::worker::engine::{Engine, EngineInput, ProgressReporter};
use async_trait::async_trait;
use serde_json::json;

/// Container signatures: (format, media type, offset, magic)
const SIGNATURES: &[(&str, MediaType, usize, &[u8])] = &[
    ("jpeg", MediaType::Image, 0, &[0xFF, 0xD8, 0xFF]),
    ("png", MediaType::Image, 0, &[0x89, b'P', b'N', b'G']),
    ("gif", MediaType::Image, 0, b"GIF8"),
    ("bmp", MediaType::Image, 0, b"BM"),
    ("tiff", MediaType::Image, 0, &[b'I', b'I', 0x2A, 0x00]),
    ("tiff", MediaType::Image, 0, &[b'M', b'M', 0x00, 0x2A]),
    ("webp", MediaType::Image, 8, b"WEBP"),
    ("avi", MediaType::Video, 8, b"AVI "),
    ("mp4", MediaType::Video, 4, b"ftyp"),
    ("matroska", MediaType::Video, 0, &[0x1A, 0x45, 0xDF, 0xA3]),
    ("flv", MediaType::Video, 0, b"FLV"),
    ("asf", MediaType::Video, 0, &[0x30, 0x26, 0xB2, 0x75]),
];

/// Sniff the container format from leading bytes.
fn detect_format(media: &[u8]) -> Option<(&'static str, MediaType)> {
    SIGNATURES
        .iter()
        .find(|(_, _, offset, magic)| {
            media
                .get(*offset..*offset + magic.len())
                .is_some_and(|window| window == *magic)
        })
        .map(|(format, media_type, _, _)| (*format, *media_type))
}

/// Reports size, digest and container format of the merged file, and
/// whether the container agrees with the file-name extension.
pub struct MetadataEngine;

#[async_trait]
impl Engine for MetadataEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Metadata
    }

    async fn run(
        &self,
        input: &EngineInput,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, String> {
        let params = match &input.params {
            EngineParams::Metadata(params) => params,
            other => {
                return Err(format!(
                    "metadata engine received {} parameters",
                    other.engine_type()
                ))
            }
        };

        progress.report("inspect", 10.0, Some("reading container")).await;
        let size = input.media.len() as u64;
        let detected = detect_format(&input.media);
        let extension_matches = detected.map(|(_, media_type)| media_type == input.file.media_type);

        if progress.is_cancelled().await {
            return Err("cancelled".into());
        }

        let sha256 = if params.compute_digest {
            progress.report("digest", 50.0, Some("hashing content")).await;
            Some(IntegrityVerifier::calculate_checksum(
                ChecksumType::Sha256,
                &input.media,
            ))
        } else {
            None
        };

        progress.report("done", 100.0, None).await;

        Ok(json!({
            "fileName": input.file.file_name,
            "mediaType": input.file.media_type,
            "size": size,
            "declaredSize": input.file.total_size,
            "sizeMatches": size == input.file.total_size,
            "detectedFormat": detected.map(|(format, _)| format),
            "extensionMatches": extension_matches,
            "sha256": sha256,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            detect_format(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]),
            Some(("jpeg", MediaType::Image))
        );
        assert_eq!(
            detect_format(b"\x00\x00\x00\x18ftypmp42"),
            Some(("mp4", MediaType::Video))
        );
        assert_eq!(
            detect_format(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            Some(("webp", MediaType::Image))
        );
        assert_eq!(detect_format(b"plain text"), None);
        assert_eq!(detect_format(&[]), None);
    }
}
