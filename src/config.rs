use std::time::Duration;

use thiserror::Error;

use crate::storage::models::{Bucket, Dimension, MediaKind, ProviderKind, StorageSettings};
use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
    #[error("Configuration store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Source of configuration that operators may change while the process runs.
///
/// Components hold one of these and re-read it on every call, so changes
/// apply without a restart.
pub trait ConfigProvider: Send + Sync {
    fn settings(&self) -> Result<StorageSettings, ConfigError>;

    /// All configured buckets, enabled or not.
    fn buckets(&self) -> Result<Vec<Bucket>, ConfigError>;

    /// Dimensions configured for one media kind.
    fn dimensions(&self, file_type: MediaKind) -> Result<Vec<Dimension>, ConfigError>;

    /// Account for `bytes` newly written to a bucket.
    fn record_usage(&self, _bucket_id: &str, _bytes: u64) -> Result<(), ConfigError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    /// Mixed into serving tokens. Without it tokens are only obfuscated.
    pub signing_secret: Option<String>,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

/// Bootstrap storage settings. Only used to seed the live configuration on
/// first start; afterwards the admin API owns these values.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory for the default local bucket
    pub local_storage_path: String,
    /// Optional second replica target on GCS
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
    pub redundancy_copies: u8,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub convert_path: String,
    pub identify_path: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Deadline for one variant generation fan-out
    pub variant_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
            redundancy_copies: StorageSettings::default().redundancy_copies,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            convert_path: "convert".to_string(),
            identify_path: "identify".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            variant_timeout: Duration::from_secs(30),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address = env_or("BIND_ADDRESS", "0.0.0.0:8080");
        let data_dir = env_or("DATA_DIR", "./data");

        let test_mode = std::env::var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(200 * 1024 * 1024); // 200MB, videos included

        let redundancy_copies = match std::env::var("REDUNDANCY_COPIES") {
            Ok(raw) => raw.trim().parse::<u8>().map_err(|_| {
                ConfigError::ValidationError(format!("REDUNDANCY_COPIES is not a number: {raw}"))
            })?,
            Err(_) => StorageSettings::default().redundancy_copies,
        };

        let variant_timeout = std::env::var("VARIANT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(MediaConfig::default().variant_timeout);

        let signing_secret = std::env::var("URL_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig {
                local_storage_path: env_or("LOCAL_STORAGE_PATH", "./files"),
                gcs_bucket: std::env::var("GCS_BUCKET").ok(),
                gcs_credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
                redundancy_copies,
            },
            media: MediaConfig {
                convert_path: env_or("CONVERT_PATH", "convert"),
                identify_path: env_or("IDENTIFY_PATH", "identify"),
                ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
                ffprobe_path: env_or("FFPROBE_PATH", "ffprobe"),
                variant_timeout,
            },
            signing_secret,
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let copies = self.storage.redundancy_copies;
        if !(StorageSettings::MIN_REDUNDANCY..=StorageSettings::MAX_REDUNDANCY).contains(&copies) {
            return Err(ConfigError::ValidationError(format!(
                "REDUNDANCY_COPIES must be between {} and {}, got {copies}",
                StorageSettings::MIN_REDUNDANCY,
                StorageSettings::MAX_REDUNDANCY
            )));
        }

        for (name, path) in [
            ("CONVERT_PATH", &self.media.convert_path),
            ("IDENTIFY_PATH", &self.media.identify_path),
            ("FFMPEG_PATH", &self.media.ffmpeg_path),
            ("FFPROBE_PATH", &self.media.ffprobe_path),
        ] {
            validate_tool_path(name, path)?;
        }

        if self.media.variant_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "VARIANT_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.signing_secret.is_none() {
            tracing::warn!(
                "URL_SIGNING_SECRET is not set. Serving tokens are derived from file ids only."
            );
        }

        Ok(())
    }

    /// Buckets written to the configuration store on first start.
    pub fn seed_buckets(&self) -> Vec<Bucket> {
        let mut buckets = vec![Bucket {
            id: "local-primary".to_string(),
            name: "Local disk".to_string(),
            provider: ProviderKind::Local,
            target: self.storage.local_storage_path.clone(),
            priority: 0,
            capacity_bytes: None,
            used_bytes: 0,
            cdn_url: None,
            enabled: true,
        }];

        if let Some(ref bucket) = self.storage.gcs_bucket {
            buckets.push(Bucket {
                id: format!("gcs-{bucket}"),
                name: format!("GCS {bucket}"),
                provider: ProviderKind::Gcs,
                target: bucket.clone(),
                priority: 10,
                capacity_bytes: None,
                used_bytes: 0,
                cdn_url: None,
                enabled: true,
            });
        }

        buckets
    }

    pub fn seed_settings(&self) -> StorageSettings {
        StorageSettings {
            redundancy_copies: self.storage.redundancy_copies,
            ..StorageSettings::default()
        }
    }
}

/// Dimensions written to the configuration store on first start.
pub fn default_dimensions() -> Vec<Dimension> {
    vec![
        Dimension {
            name: "thumbnail".to_string(),
            file_type: MediaKind::Image,
            width: Some(150),
            height: Some(150),
            quality: 80,
            format: None,
        },
        Dimension {
            name: "medium".to_string(),
            file_type: MediaKind::Image,
            width: Some(800),
            height: None,
            quality: 85,
            format: None,
        },
        Dimension {
            name: "720p".to_string(),
            file_type: MediaKind::Video,
            width: None,
            height: Some(720),
            quality: 55,
            format: Some("mp4".to_string()),
        },
        Dimension {
            name: "video_thumbnail".to_string(),
            file_type: MediaKind::Video,
            width: None,
            height: None,
            quality: 85,
            format: Some("jpg".to_string()),
        },
    ]
}

fn validate_tool_path(name: &str, path: &str) -> Result<(), ConfigError> {
    let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
    if path.is_empty() || path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(ConfigError::ValidationError(format!(
            "{name} is empty or contains shell metacharacters"
        )));
    }
    Ok(())
}
