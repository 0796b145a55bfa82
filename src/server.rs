//! Resolution of stored instances into servable bytes and HTTP metadata.

use std::sync::Arc;

use axum::http::header::{
    HeaderName, HeaderValue, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
};
use axum::http::HeaderMap;
use thiserror::Error;

use crate::config::{ConfigError, ConfigProvider};
use crate::manager::{RetrievedFile, StorageError, StorageManager};
use crate::storage::models::{Bucket, FileInstance, FileLocation, LocationStatus};
use crate::storage::{Database, DatabaseError};

pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("File or instance not found")]
    NotFound,
    #[error("Instance {0} has no active location")]
    NoActiveLocations(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Malformed Range header")]
    Invalid,
    #[error("Requested range not satisfiable")]
    OutOfBounds,
}

/// An inclusive byte range within an object of known size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    /// Value for the `Content-Range` response header.
    pub content_range: String,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// An instance together with its active replicas, best first.
#[derive(Debug, Clone)]
pub struct ResolvedInstance {
    pub instance: FileInstance,
    pub locations: Vec<FileLocation>,
}

#[derive(Debug, Clone)]
pub struct HeaderOptions {
    pub cache_control: Option<String>,
    pub etag: bool,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            cache_control: None,
            etag: true,
        }
    }
}

pub struct FileServer {
    db: Database,
    config: Arc<dyn ConfigProvider>,
    manager: Arc<StorageManager>,
}

impl FileServer {
    pub fn new(db: Database, config: Arc<dyn ConfigProvider>, manager: Arc<StorageManager>) -> Self {
        Self {
            db,
            config,
            manager,
        }
    }

    /// Find the instance named `instance_name` of a live file and its active
    /// locations, ordered by bucket priority then location priority.
    pub fn get_file_location(
        &self,
        file_id: &str,
        instance_name: &str,
    ) -> Result<ResolvedInstance, ServeError> {
        match self.db.get_file(file_id)? {
            Some(file) if !file.is_deleted() => {}
            _ => return Err(ServeError::NotFound),
        }

        let instance = self
            .db
            .find_instance(file_id, instance_name)?
            .ok_or(ServeError::NotFound)?;

        let active: Vec<FileLocation> = self
            .db
            .locations_for_instance(&instance.id)?
            .into_iter()
            .filter(|l| l.status == LocationStatus::Active)
            .collect();
        if active.is_empty() {
            return Err(ServeError::NoActiveLocations(instance.id));
        }

        let locations = order_locations(active, &self.config.buckets()?);
        Ok(ResolvedInstance {
            instance,
            locations,
        })
    }

    /// Response headers for serving `instance` in full.
    pub fn http_headers(&self, instance: &FileInstance, options: &HeaderOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let content_type = HeaderValue::from_str(&instance.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        headers.insert(CONTENT_TYPE, content_type);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(instance.byte_size));
        insert_header(
            &mut headers,
            CACHE_CONTROL,
            options
                .cache_control
                .as_deref()
                .unwrap_or(DEFAULT_CACHE_CONTROL),
        );
        if options.etag {
            if let Some(ref checksum) = instance.checksum {
                insert_header(&mut headers, ETAG, &format!("\"{checksum}\""));
            }
        }
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers
    }

    /// A replica is usable when its path is set.
    pub fn location_accessible(&self, location: &FileLocation) -> bool {
        !location.path.trim().is_empty()
    }

    /// Fetch the bytes of a resolved instance, falling over between its locations.
    pub async fn open(&self, resolved: &ResolvedInstance) -> Result<RetrievedFile, ServeError> {
        let usable: Vec<FileLocation> = resolved
            .locations
            .iter()
            .filter(|l| self.location_accessible(l))
            .cloned()
            .collect();
        if usable.is_empty() {
            return Err(ServeError::NoActiveLocations(resolved.instance.id.clone()));
        }

        let file = self.manager.retrieve_from_locations(&usable).await?;
        tracing::debug!(
            instance_id = %resolved.instance.id,
            bucket_id = %file.bucket_id,
            "Opened instance for serving"
        );
        Ok(file)
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Sort replicas by their bucket's priority, then their own. Replicas in
/// buckets missing from the configuration go last.
pub fn order_locations(mut locations: Vec<FileLocation>, buckets: &[Bucket]) -> Vec<FileLocation> {
    let bucket_priority = |id: &str| {
        buckets
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.priority)
            .unwrap_or(i32::MAX)
    };
    locations.sort_by_key(|l| (bucket_priority(&l.bucket_id), l.priority));
    locations
}

/// True when an `If-None-Match` value names `etag`: `*`, or any entry of the
/// comma-separated list under weak comparison.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = etag.trim().trim_start_matches("W/");
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || (!candidate.is_empty() && candidate.trim_start_matches("W/") == etag)
    })
}

/// Parse a single `bytes=<start>-<end>` or `bytes=<start>-` range against an
/// object of `size` bytes. No header means the whole object.
pub fn parse_range_header(header: Option<&str>, size: u64) -> Result<Option<ByteRange>, RangeError> {
    let Some(raw) = header else {
        return Ok(None);
    };

    let raw = raw.trim();
    let bounds = raw
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &raw[6..])
        .ok_or(RangeError::Invalid)?;
    let (start, end) = bounds.split_once('-').ok_or(RangeError::Invalid)?;

    let start: u64 = start.trim().parse().map_err(|_| RangeError::Invalid)?;
    let end: u64 = match end.trim() {
        "" => size.checked_sub(1).ok_or(RangeError::OutOfBounds)?,
        end => end.parse().map_err(|_| RangeError::Invalid)?,
    };

    if start > end || end >= size {
        return Err(RangeError::OutOfBounds);
    }

    Ok(Some(ByteRange {
        start,
        end,
        content_range: format!("bytes {start}-{end}/{size}"),
    }))
}
