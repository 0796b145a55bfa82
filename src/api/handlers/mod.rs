mod admin;
mod files;
mod serve;

use crate::api::response::ApiError;
use crate::manager::StorageError;
use crate::server::ServeError;
use crate::variants::VariantError;

pub use admin::{
    admin_purge, delete_bucket, get_dimensions, get_settings, health, list_buckets, put_bucket,
    put_dimensions, put_settings,
};
pub use files::{create_file, delete_file, generate_variants, get_file, list_files};
pub use serve::serve_file;

fn db_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::internal(e.to_string())
}

/// Replica failures are availability problems, not client mistakes.
fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::NoBucketsAvailable
        | StorageError::AllWritesFailed { .. }
        | StorageError::NotFoundInAnyBucket(_) => ApiError::unavailable(e.to_string()),
        StorageError::InvalidPath(_) => ApiError::bad_request(e.to_string()),
        _ => ApiError::internal(e.to_string()),
    }
}

fn serve_error(e: ServeError) -> ApiError {
    match e {
        ServeError::NotFound => ApiError::not_found("File not found"),
        ServeError::NoActiveLocations(_) => ApiError::not_found("File has no available replica"),
        ServeError::Storage(e) => storage_error(e),
        _ => ApiError::internal(e.to_string()),
    }
}

fn variant_error(e: VariantError) -> ApiError {
    match e {
        VariantError::AllVariantsFailed { .. } => ApiError::unprocessable(e.to_string()),
        VariantError::MissingOriginal(_) | VariantError::OriginalUnavailable(_) => {
            ApiError::unavailable(e.to_string())
        }
        _ => ApiError::internal(e.to_string()),
    }
}
