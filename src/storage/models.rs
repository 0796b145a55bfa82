use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variant name reserved for the uploaded bytes themselves.
pub const ORIGINAL_VARIANT: &str = "original";

/// Classification of a file derived from its MIME type. Variant generation
/// dispatches on this, never on raw MIME prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    /// Derive a media kind from a MIME type string.
    pub fn from_mime(mime_type: &str) -> Self {
        let primary = mime_type.split('/').next().unwrap_or("");
        match primary.trim().to_ascii_lowercase().as_str() {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Other => "other",
        }
    }

    pub fn supports_variants(&self) -> bool {
        !matches!(self, MediaKind::Other)
    }
}

/// Lifecycle of a derivative. Terminal states never move again; a failed
/// rendition is retried by creating a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (ProcessingStatus::Pending, ProcessingStatus::Processing)
                | (ProcessingStatus::Processing, ProcessingStatus::Completed)
                | (_, ProcessingStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationStatus {
    Active,
    Syncing,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gcs,
    Local,
}

/// A configured storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    /// Provider-specific address: a directory for `local`, a bucket name for `gcs`.
    pub target: String,
    /// Lower is preferred.
    pub priority: i32,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub cdn_url: Option<String>,
    pub enabled: bool,
}

impl Bucket {
    /// Share of capacity still free, in `0.0..=1.0`. Unlimited buckets report 1.0.
    pub fn free_space_ratio(&self) -> f64 {
        match self.capacity_bytes {
            None => 1.0,
            Some(0) => 0.0,
            Some(capacity) => {
                let free = capacity.saturating_sub(self.used_bytes);
                free as f64 / capacity as f64
            }
        }
    }
}

/// A logical asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub file_type: MediaKind,
    pub original_filename: String,
    pub mime_type: String,
    pub extension: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One named rendition of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInstance {
    pub id: String,
    pub file_id: String,
    pub variant_name: String,
    pub mime_type: String,
    pub extension: String,
    #[serde(default)]
    pub checksum: Option<String>,
    pub byte_size: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
}

impl FileInstance {
    pub fn is_original(&self) -> bool {
        self.variant_name == ORIGINAL_VARIANT
    }
}

/// One physical replica of an instance inside one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLocation {
    pub instance_id: String,
    pub bucket_id: String,
    pub path: String,
    pub status: LocationStatus,
    /// Manual ordering override within a bucket.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Administrator-defined derivative size and format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub file_type: MediaKind,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Output format override (e.g. `webp`, `mp4`).
    #[serde(default)]
    pub format: Option<String>,
}

fn default_quality() -> u8 {
    85
}

impl Dimension {
    /// Both sides fixed: the rendition is cropped to exactly this box.
    pub fn fixed_box(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// Storage behaviour that operators can change at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub redundancy_copies: u8,
    pub auto_generate_variants: bool,
}

impl StorageSettings {
    pub const MIN_REDUNDANCY: u8 = 1;
    pub const MAX_REDUNDANCY: u8 = 5;

    pub fn clamp_redundancy(copies: u8) -> u8 {
        copies.clamp(Self::MIN_REDUNDANCY, Self::MAX_REDUNDANCY)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            redundancy_copies: 2,
            auto_generate_variants: true,
        }
    }
}
