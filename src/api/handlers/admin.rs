use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::db_error;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::storage::models::{Bucket, Dimension, StorageSettings, ORIGINAL_VARIANT};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub files_deleted: u64,
    pub instances_deleted: u64,
}

/// Partial settings update; absent fields keep their value.
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    pub redundancy_copies: Option<u8>,
    #[serde(default)]
    pub auto_generate_variants: Option<bool>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<StorageSettings>>, ApiError> {
    let settings = state.db.get_settings().map_err(db_error)?.unwrap_or_default();
    Ok(JSend::success(settings))
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<UpdateSettingsRequest>,
) -> Result<Json<JSend<StorageSettings>>, ApiError> {
    let mut settings = state.db.get_settings().map_err(db_error)?.unwrap_or_default();

    if let Some(copies) = req.redundancy_copies {
        if !(StorageSettings::MIN_REDUNDANCY..=StorageSettings::MAX_REDUNDANCY).contains(&copies) {
            return Err(ApiError::bad_request(format!(
                "redundancy_copies must be between {} and {}",
                StorageSettings::MIN_REDUNDANCY,
                StorageSettings::MAX_REDUNDANCY
            )));
        }
        settings.redundancy_copies = copies;
    }
    if let Some(enabled) = req.auto_generate_variants {
        settings.auto_generate_variants = enabled;
    }

    state.db.put_settings(&settings).map_err(db_error)?;
    tracing::info!(
        redundancy_copies = settings.redundancy_copies,
        auto_generate_variants = settings.auto_generate_variants,
        "Updated storage settings"
    );
    Ok(JSend::success(settings))
}

pub async fn list_buckets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<Vec<Bucket>>>, ApiError> {
    Ok(JSend::success(state.db.list_buckets().map_err(db_error)?))
}

/// Create or replace a bucket. The path id wins over any id in the body.
pub async fn put_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(mut bucket): AppJson<Bucket>,
) -> Result<Json<JSend<Bucket>>, ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::bad_request("bucket id must not be empty"));
    }
    if bucket.target.trim().is_empty() {
        return Err(ApiError::bad_request("target must not be empty"));
    }
    if !state.manager.has_provider(bucket.provider) {
        return Err(ApiError::bad_request(format!(
            "no provider is configured for {:?} buckets",
            bucket.provider
        )));
    }

    bucket.id = id;
    // Usage is tracked by the store, not supplied by clients.
    if let Some(existing) = state
        .db
        .list_buckets()
        .map_err(db_error)?
        .into_iter()
        .find(|b| b.id == bucket.id)
    {
        bucket.used_bytes = existing.used_bytes;
    } else {
        bucket.used_bytes = 0;
    }

    state.db.put_bucket(&bucket).map_err(db_error)?;
    tracing::info!(bucket_id = %bucket.id, enabled = bucket.enabled, "Saved bucket");
    Ok(JSend::success(bucket))
}

pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    if !state.db.delete_bucket(&id).map_err(db_error)? {
        return Err(ApiError::not_found("Bucket not found"));
    }
    tracing::info!(bucket_id = %id, "Removed bucket");
    Ok(JSend::success(()))
}

pub async fn get_dimensions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<Vec<Dimension>>>, ApiError> {
    Ok(JSend::success(state.db.list_dimensions().map_err(db_error)?))
}

/// Replace the whole dimension set.
pub async fn put_dimensions(
    State(state): State<Arc<AppState>>,
    AppJson(dimensions): AppJson<Vec<Dimension>>,
) -> Result<Json<JSend<Vec<Dimension>>>, ApiError> {
    validate_dimensions(&dimensions)?;
    state.db.replace_dimensions(&dimensions).map_err(db_error)?;
    tracing::info!(count = dimensions.len(), "Replaced dimensions");
    Ok(JSend::success(dimensions))
}

pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let stats = state.db.purge_all().map_err(db_error)?;

    tracing::warn!(files = stats.files, instances = stats.instances, "Purged all data");

    Ok(JSend::success(PurgeResponse {
        files_deleted: stats.files,
        instances_deleted: stats.instances,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_dimensions(dimensions: &[Dimension]) -> Result<(), ApiError> {
    let mut seen = HashSet::new();
    for dimension in dimensions {
        let name = dimension.name.trim();
        if name.is_empty() {
            return Err(ApiError::bad_request("dimension name must not be empty"));
        }
        if name == ORIGINAL_VARIANT {
            return Err(ApiError::bad_request(format!(
                "'{ORIGINAL_VARIANT}' is reserved for uploaded files"
            )));
        }
        if name.contains('/') {
            return Err(ApiError::bad_request(format!(
                "dimension name '{name}' must not contain '/'"
            )));
        }
        if !(1..=100).contains(&dimension.quality) {
            return Err(ApiError::bad_request(format!(
                "quality of '{name}' must be between 1 and 100"
            )));
        }
        if dimension.width == Some(0) || dimension.height == Some(0) {
            return Err(ApiError::bad_request(format!(
                "width and height of '{name}' must be positive"
            )));
        }
        if !seen.insert((dimension.file_type, name)) {
            return Err(ApiError::bad_request(format!(
                "dimension '{name}' is defined twice for {} files",
                dimension.file_type.as_str()
            )));
        }
    }
    Ok(())
}
