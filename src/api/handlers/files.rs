use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::{db_error, storage_error, variant_error};
use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::ingest::{IngestError, UploadRequest};
use crate::manager::BucketScope;
use crate::storage::models::{
    FileInstance, FileRecord, LocationStatus, MediaKind, ProcessingStatus,
};
use crate::variants::GenerateOptions;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub id: String,
    pub variant_name: String,
    pub processing_status: ProcessingStatus,
    pub mime_type: String,
    pub byte_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub checksum: Option<String>,
    /// Signed serving URL, present once the instance is completed.
    pub url: Option<String>,
    pub replicas: usize,
}

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub owner_id: Option<String>,
    pub file_type: MediaKind,
    pub original_filename: String,
    pub mime_type: String,
    pub extension: String,
    pub created_at: String,
    pub instances: Vec<InstanceResponse>,
}

#[derive(Debug, Serialize)]
pub struct ReplicationResponse {
    pub attempted: usize,
    pub succeeded: usize,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub file: FileResponse,
    pub replication: ReplicationResponse,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub replicas_deleted: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub file_type: Option<MediaKind>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateVariantsParams {
    /// Comma-separated dimension names.
    #[serde(default)]
    pub dimensions: Option<String>,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let mut upload = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut owner_id: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());

                let path = tempfile::Builder::new()
                    .prefix("upload-")
                    .tempfile()
                    .map_err(|e| ApiError::internal(format!("Failed to buffer upload: {e}")))?
                    .into_temp_path();
                let mut out = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| ApiError::internal(format!("Failed to buffer upload: {e}")))?;

                let mut written: u64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?
                {
                    written += chunk.len() as u64;
                    if written > state.config.max_upload_size {
                        return Err(ApiError::payload_too_large(format!(
                            "File exceeds maximum upload size of {} bytes",
                            state.config.max_upload_size
                        )));
                    }
                    out.write_all(&chunk)
                        .await
                        .map_err(|e| ApiError::internal(format!("Failed to buffer upload: {e}")))?;
                }
                out.flush()
                    .await
                    .map_err(|e| ApiError::internal(format!("Failed to buffer upload: {e}")))?;
                upload = Some(path);
            }
            "owner_id" => {
                owner_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid owner_id: {e}")))?,
                );
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let original_filename = file_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "upload".to_string());

    let ingested = state
        .ingest
        .ingest(
            &upload,
            UploadRequest {
                original_filename,
                mime_type: file_content_type,
                owner_id,
            },
        )
        .await
        .map_err(|e| match e {
            IngestError::Storage(e) => storage_error(e),
            e => ApiError::internal(e.to_string()),
        })?;
    drop(upload);

    if ingested.file.file_type.supports_variants() {
        state
            .variants
            .generate_variants(
                &ingested.file,
                GenerateOptions {
                    blocking: false,
                    ..Default::default()
                },
            )
            .await
            .map_err(variant_error)?;
    }

    tracing::debug!(file_id = %ingested.file.id, "Created file");

    let file = file_to_response(&state, &ingested.file)?;
    Ok(JSend::success(UploadResponse {
        file,
        replication: ReplicationResponse {
            attempted: ingested.stored.attempted,
            succeeded: ingested.stored.succeeded,
        },
    }))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = live_file(&state, &id)?;
    Ok(JSend::success(file_to_response(&state, &file)?))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<DeleteResponse>>, ApiError> {
    live_file(&state, &id)?;
    state.db.mark_file_deleted(&id).map_err(db_error)?;

    // Replica removal is best effort; the soft delete above already hides the file.
    let mut replicas_deleted = 0;
    for instance in state.db.instances_for_file(&id).map_err(db_error)? {
        let locations = state
            .db
            .locations_for_instance(&instance.id)
            .map_err(db_error)?;

        let mut by_path: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for location in locations
            .iter()
            .filter(|l| l.status == LocationStatus::Active)
        {
            by_path
                .entry(location.path.as_str())
                .or_default()
                .push(location.bucket_id.as_str());
        }

        for (path, buckets) in by_path {
            match state
                .manager
                .delete_file(path, &BucketScope::only(buckets))
                .await
            {
                Ok(deleted) => replicas_deleted += deleted,
                Err(e) => {
                    tracing::warn!(file_id = %id, path = %path, error = %e, "Failed to delete replicas");
                }
            }
        }

        state
            .db
            .set_location_status(&instance.id, None, LocationStatus::Deleted)
            .map_err(db_error)?;
    }

    tracing::debug!(file_id = %id, replicas_deleted, "Deleted file");
    Ok(JSend::success(DeleteResponse {
        id,
        replicas_deleted,
    }))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let files = state
        .db
        .list_files(params.file_type, params.owner_id.as_deref())
        .map_err(db_error)?;

    let total = files.len() as u64;
    let items = files
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(|file| file_to_response(&state, file))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

/// Regenerate variants now, optionally for a subset of dimensions.
pub async fn generate_variants(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<GenerateVariantsParams>,
) -> Result<Json<JSend<Vec<InstanceResponse>>>, ApiError> {
    let file = live_file(&state, &id)?;
    if !file.file_type.supports_variants() {
        return Err(ApiError::bad_request(format!(
            "{} files have no variants",
            file.file_type.as_str()
        )));
    }

    let dimensions = params.dimensions.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    let instances = state
        .variants
        .generate_variants(
            &file,
            GenerateOptions {
                dimensions,
                ..Default::default()
            },
        )
        .await
        .map_err(variant_error)?;

    let items = instances
        .iter()
        .map(|instance| instance_to_response(&state, instance))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(JSend::success(items))
}

// ============================================================================
// Helpers
// ============================================================================

fn live_file(state: &AppState, id: &str) -> Result<FileRecord, ApiError> {
    state
        .db
        .get_file(id)
        .map_err(db_error)?
        .filter(|f| !f.is_deleted())
        .ok_or_else(|| ApiError::not_found("File not found"))
}

fn file_to_response(state: &AppState, file: &FileRecord) -> Result<FileResponse, ApiError> {
    let instances = state
        .db
        .instances_for_file(&file.id)
        .map_err(db_error)?
        .iter()
        .map(|instance| instance_to_response(state, instance))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FileResponse {
        id: file.id.clone(),
        owner_id: file.owner_id.clone(),
        file_type: file.file_type,
        original_filename: file.original_filename.clone(),
        mime_type: file.mime_type.clone(),
        extension: file.extension.clone(),
        created_at: file.created_at.to_rfc3339(),
        instances,
    })
}

fn instance_to_response(
    state: &AppState,
    instance: &FileInstance,
) -> Result<InstanceResponse, ApiError> {
    let replicas = state
        .db
        .locations_for_instance(&instance.id)
        .map_err(db_error)?
        .iter()
        .filter(|l| l.status == LocationStatus::Active)
        .count();
    let url = (instance.processing_status == ProcessingStatus::Completed)
        .then(|| state.signer.signed_url(&instance.file_id, &instance.variant_name));

    Ok(InstanceResponse {
        id: instance.id.clone(),
        variant_name: instance.variant_name.clone(),
        processing_status: instance.processing_status,
        mime_type: instance.mime_type.clone(),
        byte_size: instance.byte_size,
        width: instance.width,
        height: instance.height,
        checksum: instance.checksum.clone(),
        url,
        replicas,
    })
}
