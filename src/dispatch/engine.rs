//! Engine catalogue and per-engine parameter schemas.

use crate::chunk::MediaType;
use crate::config::TopicConfig;
use crate::dispatch::error::{DispatchError, DispatchResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineType {
    ImageAi,
    TraditionalImage,
    Metadata,
    VideoTraditionalNoise,
    VideoAi,
}

/// Where an engine runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Consumed by this process's worker pool
    InProcess,
    /// Consumed by external workers that fetch media by URL
    OutOfProcess,
}

const IMAGE_ONLY: &[MediaType] = &[MediaType::Image];
const VIDEO_ONLY: &[MediaType] = &[MediaType::Video];
const IMAGE_AND_VIDEO: &[MediaType] = &[MediaType::Image, MediaType::Video];

impl EngineType {
    pub const ALL: [EngineType; 5] = [
        EngineType::ImageAi,
        EngineType::TraditionalImage,
        EngineType::Metadata,
        EngineType::VideoTraditionalNoise,
        EngineType::VideoAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::ImageAi => "IMAGE_AI",
            EngineType::TraditionalImage => "TRADITIONAL_IMAGE",
            EngineType::Metadata => "METADATA",
            EngineType::VideoTraditionalNoise => "VIDEO_TRADITIONAL_NOISE",
            EngineType::VideoAi => "VIDEO_AI",
        }
    }

    pub fn eligible_media(&self) -> &'static [MediaType] {
        match self {
            EngineType::ImageAi | EngineType::TraditionalImage => IMAGE_ONLY,
            EngineType::Metadata => IMAGE_AND_VIDEO,
            EngineType::VideoTraditionalNoise | EngineType::VideoAi => VIDEO_ONLY,
        }
    }

    pub fn supports(&self, media_type: MediaType) -> bool {
        self.eligible_media().contains(&media_type)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            EngineType::TraditionalImage | EngineType::Metadata => ExecutionMode::InProcess,
            EngineType::ImageAi | EngineType::VideoTraditionalNoise | EngineType::VideoAi => {
                ExecutionMode::OutOfProcess
            }
        }
    }

    pub fn topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        match self {
            EngineType::ImageAi => &topics.image_ai,
            EngineType::TraditionalImage => &topics.traditional_image,
            EngineType::Metadata => &topics.metadata,
            EngineType::VideoTraditionalNoise => &topics.video_traditional,
            EngineType::VideoAi => &topics.video_ai,
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown engine type: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ImageAiParams {
    pub model: String,
}

impl Default for ImageAiParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
        }
    }
}

/// Error-level, copy-move and lighting analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TraditionalImageParams {
    /// JPEG re-save quality for error-level analysis (1-100)
    pub ela_quality: u8,
    pub ela_scale: u32,
    pub block_size: u32,
    pub similarity_threshold: f64,
    /// 1-10
    pub lighting_sensitivity: u8,
}

impl Default for TraditionalImageParams {
    fn default() -> Self {
        Self {
            ela_quality: 95,
            ela_scale: 20,
            block_size: 8,
            similarity_threshold: 10.0,
            lighting_sensitivity: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MetadataParams {
    pub compute_digest: bool,
}

impl Default for MetadataParams {
    fn default() -> Self {
        Self {
            compute_digest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct VideoNoiseParams {
    pub sample_frames: u32,
    pub noise_sigma: f64,
}

impl Default for VideoNoiseParams {
    fn default() -> Self {
        Self {
            sample_frames: 30,
            noise_sigma: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct VideoAiParams {
    pub model: String,
}

impl Default for VideoAiParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
        }
    }
}

/// Typed parameters, one schema per engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineParams {
    ImageAi(ImageAiParams),
    TraditionalImage(TraditionalImageParams),
    Metadata(MetadataParams),
    VideoTraditionalNoise(VideoNoiseParams),
    VideoAi(VideoAiParams),
}

impl EngineParams {
    pub fn defaults(engine: EngineType) -> Self {
        match engine {
            EngineType::ImageAi => EngineParams::ImageAi(ImageAiParams::default()),
            EngineType::TraditionalImage => {
                EngineParams::TraditionalImage(TraditionalImageParams::default())
            }
            EngineType::Metadata => EngineParams::Metadata(MetadataParams::default()),
            EngineType::VideoTraditionalNoise => {
                EngineParams::VideoTraditionalNoise(VideoNoiseParams::default())
            }
            EngineType::VideoAi => EngineParams::VideoAi(VideoAiParams::default()),
        }
    }

    /// Decode `raw` against the schema of `engine`; absent or null params
    /// take the engine defaults.
    pub fn parse(engine: EngineType, raw: Option<&serde_json::Value>) -> DispatchResult<Self> {
        let raw = match raw {
            None | Some(serde_json::Value::Null) => return Ok(Self::defaults(engine)),
            Some(raw) => raw,
        };

        let params = match engine {
            EngineType::ImageAi => EngineParams::ImageAi(decode(engine, raw)?),
            EngineType::TraditionalImage => EngineParams::TraditionalImage(decode(engine, raw)?),
            EngineType::Metadata => EngineParams::Metadata(decode(engine, raw)?),
            EngineType::VideoTraditionalNoise => {
                EngineParams::VideoTraditionalNoise(decode(engine, raw)?)
            }
            EngineType::VideoAi => EngineParams::VideoAi(decode(engine, raw)?),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn engine_type(&self) -> EngineType {
        match self {
            EngineParams::ImageAi(_) => EngineType::ImageAi,
            EngineParams::TraditionalImage(_) => EngineType::TraditionalImage,
            EngineParams::Metadata(_) => EngineType::Metadata,
            EngineParams::VideoTraditionalNoise(_) => EngineType::VideoTraditionalNoise,
            EngineParams::VideoAi(_) => EngineType::VideoAi,
        }
    }

    pub fn to_value(&self) -> DispatchResult<serde_json::Value> {
        let value = match self {
            EngineParams::ImageAi(p) => serde_json::to_value(p)?,
            EngineParams::TraditionalImage(p) => serde_json::to_value(p)?,
            EngineParams::Metadata(p) => serde_json::to_value(p)?,
            EngineParams::VideoTraditionalNoise(p) => serde_json::to_value(p)?,
            EngineParams::VideoAi(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn validate(&self) -> DispatchResult<()> {
        let invalid = |reason: &str| {
            Err(DispatchError::InvalidParams {
                engine: self.engine_type().to_string(),
                reason: reason.to_string(),
            })
        };

        match self {
            EngineParams::TraditionalImage(p) => {
                if !(1..=100).contains(&p.ela_quality) {
                    return invalid("elaQuality must be between 1 and 100");
                }
                if !(1..=10).contains(&p.lighting_sensitivity) {
                    return invalid("lightingSensitivity must be between 1 and 10");
                }
                if p.block_size == 0 {
                    return invalid("blockSize must be positive");
                }
            }
            EngineParams::VideoTraditionalNoise(p) => {
                if p.sample_frames == 0 {
                    return invalid("sampleFrames must be positive");
                }
                if p.noise_sigma.is_nan() || p.noise_sigma <= 0.0 {
                    return invalid("noiseSigma must be positive");
                }
            }
            EngineParams::ImageAi(ImageAiParams { model })
            | EngineParams::VideoAi(VideoAiParams { model }) => {
                if model.trim().is_empty() {
                    return invalid("model must not be empty");
                }
            }
            EngineParams::Metadata(_) => {}
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(engine: EngineType, raw: &serde_json::Value) -> DispatchResult<T> {
    T::deserialize(raw).map_err(|e| DispatchError::InvalidParams {
        engine: engine.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catalogue_gating() {
        assert!(EngineType::ImageAi.supports(MediaType::Image));
        assert!(!EngineType::ImageAi.supports(MediaType::Video));
        assert!(EngineType::Metadata.supports(MediaType::Video));
        assert!(!EngineType::VideoAi.supports(MediaType::Image));
        assert!(EngineType::ALL.iter().all(|e| !e.supports(MediaType::Unknown)));
    }

    #[test]
    fn test_topics_follow_config() {
        let topics = TopicConfig::default();
        assert_eq!(
            EngineType::VideoTraditionalNoise.topic(&topics),
            "video-traditional-analysis-tasks"
        );
        assert_eq!(EngineType::TraditionalImage.topic(&topics), "traditional-analysis-tasks");
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(EngineType::VideoTraditionalNoise).unwrap(),
            json!("VIDEO_TRADITIONAL_NOISE")
        );
        assert_eq!("IMAGE_AI".parse::<EngineType>().unwrap(), EngineType::ImageAi);
        assert!("ELA".parse::<EngineType>().is_err());
    }

    #[test]
    fn test_noise_defaults() {
        let params = EngineParams::parse(EngineType::VideoTraditionalNoise, None).unwrap();
        assert_eq!(
            params.to_value().unwrap(),
            json!({"sampleFrames": 30, "noiseSigma": 10.0})
        );
    }

    #[test]
    fn test_partial_params_fill_defaults() {
        let params = EngineParams::parse(
            EngineType::TraditionalImage,
            Some(&json!({"elaQuality": 80})),
        )
        .unwrap();
        match params {
            EngineParams::TraditionalImage(p) => {
                assert_eq!(p.ela_quality, 80);
                assert_eq!(p.block_size, 8);
            }
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn test_params_for_wrong_engine_rejected() {
        // Noise parameters sent to the image AI engine
        let result = EngineParams::parse(EngineType::ImageAi, Some(&json!({"sampleFrames": 10})));
        assert!(matches!(result, Err(DispatchError::InvalidParams { .. })));

        let result = EngineParams::parse(
            EngineType::VideoTraditionalNoise,
            Some(&json!({"noiseSigma": -1.0})),
        );
        assert!(matches!(result, Err(DispatchError::InvalidParams { .. })));
    }
}
