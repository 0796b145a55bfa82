//! Intake of uploaded originals.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::digest::sha256_file;
use crate::manager::{StorageError, StorageManager, StoreOptions, StoredFile};
use crate::media::TransformTable;
use crate::storage::models::{
    FileInstance, FileLocation, FileRecord, LocationStatus, MediaKind, ProcessingStatus,
    ORIGINAL_VARIANT,
};
use crate::storage::{Database, DatabaseError, RenditionOutput};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Describes an upload whose bytes already sit in a local file.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub original_filename: String,
    /// Client-declared type; guessed from the file name when absent or generic.
    pub mime_type: Option<String>,
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestedFile {
    pub file: FileRecord,
    pub original: FileInstance,
    pub stored: StoredFile,
}

#[derive(Clone)]
pub struct IngestService {
    manager: Arc<StorageManager>,
    db: Database,
    transforms: TransformTable,
}

impl IngestService {
    pub fn new(manager: Arc<StorageManager>, db: Database, transforms: TransformTable) -> Self {
        Self {
            manager,
            db,
            transforms,
        }
    }

    /// Replicate `source` as the original of a new file and record it.
    pub async fn ingest(
        &self,
        source: &Path,
        request: UploadRequest,
    ) -> Result<IngestedFile, IngestError> {
        let mime_type = resolve_mime(&request);
        let file_type = MediaKind::from_mime(&mime_type);
        let extension = resolve_extension(&request.original_filename, &mime_type);
        let (checksum, byte_size) = sha256_file(source).await?;

        // Unprobeable media is still stored; it just has no recorded size.
        let (width, height) = match self.transforms.for_kind(file_type) {
            Some(transform) => match transform.read_dimensions(source).await {
                Ok((w, h)) => (Some(w), Some(h)),
                Err(e) => {
                    tracing::warn!(filename = %request.original_filename, error = %e, "Could not read upload dimensions");
                    (None, None)
                }
            },
            None => (None, None),
        };

        let stem = Path::new(&request.original_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ORIGINAL_VARIANT.to_string());
        let stored = self
            .manager
            .store_file(
                source,
                StoreOptions {
                    file_name: Some(format!("{stem}.{extension}")),
                    content_type: Some(mime_type.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let now = Utc::now();
        let file = FileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: request.owner_id.filter(|o| !o.is_empty()),
            file_type,
            original_filename: request.original_filename.clone(),
            mime_type: mime_type.clone(),
            extension: extension.clone(),
            created_at: now,
            deleted_at: None,
        };
        self.db.put_file(&file)?;

        let original = FileInstance {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file.id.clone(),
            variant_name: ORIGINAL_VARIANT.to_string(),
            mime_type: mime_type.clone(),
            extension: extension.clone(),
            checksum: None,
            byte_size,
            width,
            height,
            processing_status: ProcessingStatus::Processing,
            created_at: now,
        };
        self.db.put_instance(&original)?;

        let locations: Vec<FileLocation> = stored
            .replicas
            .iter()
            .map(|replica| FileLocation {
                instance_id: original.id.clone(),
                bucket_id: replica.bucket_id.clone(),
                path: stored.path.clone(),
                status: LocationStatus::Active,
                priority: 0,
                last_verified_at: Some(now),
            })
            .collect();
        let original = self.db.complete_instance(
            &original.id,
            &RenditionOutput {
                mime_type,
                extension,
                checksum,
                byte_size,
                width,
                height,
            },
            &locations,
        )?;

        tracing::info!(
            file_id = %file.id,
            file_type = %file.file_type.as_str(),
            byte_size,
            copies = stored.succeeded,
            "Ingested upload"
        );

        Ok(IngestedFile {
            file,
            original,
            stored,
        })
    }
}

fn resolve_mime(request: &UploadRequest) -> String {
    request
        .mime_type
        .clone()
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
        .or_else(|| {
            mime_guess::from_path(&request.original_filename)
                .first()
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn resolve_extension(filename: &str, mime_type: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .or_else(|| {
            mime_guess::get_mime_extensions_str(mime_type)
                .and_then(|exts| exts.first())
                .map(|ext| ext.to_string())
        })
        .unwrap_or_else(|| "bin".to_string())
}
