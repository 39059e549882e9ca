//! Service configuration.
//!
//! Values resolve in this order: command-line flags (handled by the server
//! binary), TOML file, compiled defaults. Every section is optional in the
//! file; missing keys fall back to their defaults.

use crate::integrity::ChecksumType;
use crate::materializer::ChunkRetention;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub dispatch: DispatchConfig,
    pub progress: ProgressConfig,
    pub workers: WorkerConfig,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://mediatrace.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub bucket: String,
    /// Base URL out-of-process engines use to fetch merged objects.
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            bucket: "forensic-media".to_string(),
            public_base_url: "http://localhost:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Ceiling for a single chunk payload, in bytes.
    pub max_chunk_size: usize,
    pub checksum: ChecksumType,
    pub chunk_retention: ChunkRetention,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 10 * 1024 * 1024,
            checksum: ChecksumType::Md5,
            chunk_retention: ChunkRetention::DeleteBlobs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub image_ai: String,
    pub traditional_image: String,
    pub metadata: String,
    pub video_traditional: String,
    pub video_ai: String,
    pub results: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            image_ai: "image-ai-analysis-tasks".to_string(),
            traditional_image: "traditional-analysis-tasks".to_string(),
            metadata: "metadata-analysis".to_string(),
            video_traditional: "video-traditional-analysis-tasks".to_string(),
            video_ai: "video-ai-analysis-tasks".to_string(),
            results: "analysis-results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub partitions: usize,
    pub channel_capacity: usize,
    pub publish_timeout_ms: u64,
    pub topics: TopicConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            channel_capacity: 1024,
            publish_timeout_ms: 5_000,
            topics: TopicConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub ttl_secs: u64,
    pub grace_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            grace_secs: 300,
            gc_interval_secs: 60,
        }
    }
}

impl ProgressConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ServiceConfig {
    /// Load from a TOML file, falling back to defaults for absent keys.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.upload.max_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_chunk_size must be greater than zero".into(),
            ));
        }
        if self.dispatch.partitions == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.partitions must be greater than zero".into(),
            ));
        }
        if self.dispatch.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.channel_capacity must be greater than zero".into(),
            ));
        }
        if self.dispatch.publish_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.publish_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.workers.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "workers.max_concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
