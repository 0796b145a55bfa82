//! Multi-bucket storage orchestration.
//!
//! Writes fan out to several buckets at once and succeed as soon as one copy
//! lands. Reads walk the buckets one at a time in priority order and return
//! the first copy that can be fetched.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tempfile::TempPath;
use thiserror::Error;

use crate::config::{ConfigError, ConfigProvider};
use crate::providers::{validate_object_path, BucketProvider, ProviderError, ProviderRegistry};
use crate::storage::models::{Bucket, FileLocation, ProviderKind, StorageSettings};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No enabled buckets available")]
    NoBucketsAvailable,
    #[error("All {attempted} bucket writes failed for {path}")]
    AllWritesFailed { path: String, attempted: usize },
    #[error("Object not found in any bucket: {0}")]
    NotFoundInAnyBucket(String),
    #[error("All {attempted} bucket deletions failed for {path}")]
    AllDeletesFailed { path: String, attempted: usize },
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for [`StorageManager::store_file`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Target number of copies; the live setting applies when unset. Clamped to 1..=5.
    pub redundancy_copies: Option<u8>,
    /// Write only to these buckets (still limited to enabled ones).
    pub explicit_buckets: Option<Vec<String>>,
    /// Destination directory, e.g. the original's directory for its variants.
    pub path_prefix: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

/// Restricts read-side operations to a subset of buckets, tried in the given order.
#[derive(Debug, Clone, Default)]
pub struct BucketScope {
    pub buckets: Option<Vec<String>>,
}

impl BucketScope {
    pub fn only(buckets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            buckets: Some(buckets.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReplica {
    pub bucket_id: String,
    pub byte_size: u64,
}

/// Outcome of a replicated write.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Object path, identical in every bucket.
    pub path: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub replicas: Vec<StoredReplica>,
}

impl StoredFile {
    pub fn is_fully_replicated(&self) -> bool {
        self.succeeded == self.attempted
    }
}

/// A local copy of a stored object. The file is removed when this is dropped.
#[derive(Debug)]
pub struct RetrievedFile {
    pub path: TempPath,
    pub bucket_id: String,
}

pub struct StorageManager {
    config: Arc<dyn ConfigProvider>,
    providers: ProviderRegistry,
}

impl StorageManager {
    pub fn new(config: Arc<dyn ConfigProvider>, providers: ProviderRegistry) -> Self {
        Self { config, providers }
    }

    /// Write `source` to up to `redundancy_copies` buckets concurrently.
    pub async fn store_file(
        &self,
        source: &Path,
        options: StoreOptions,
    ) -> Result<StoredFile, StorageError> {
        let settings = self.config.settings()?;
        let copies = StorageSettings::clamp_redundancy(
            options
                .redundancy_copies
                .unwrap_or(settings.redundancy_copies),
        ) as usize;

        let targets = select_write_targets(
            self.config.buckets()?,
            options.explicit_buckets.as_deref(),
            copies,
        );
        if targets.is_empty() {
            tracing::error!("Store requested but no enabled bucket is configured");
            return Err(StorageError::NoBucketsAvailable);
        }

        let path = build_object_path(&options);
        validate_object_path(&path).map_err(|_| StorageError::InvalidPath(path.clone()))?;
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let writes = targets.iter().map(|bucket| {
            let path = path.as_str();
            async move {
                let outcome = match self.provider_for(bucket) {
                    Ok(provider) => provider.store(bucket, source, path, content_type).await,
                    Err(e) => Err(e),
                };
                (bucket, outcome)
            }
        });

        let mut replicas = Vec::new();
        for (bucket, outcome) in join_all(writes).await {
            match outcome {
                Ok(info) => {
                    if let Err(e) = self.config.record_usage(&bucket.id, info.byte_size) {
                        tracing::warn!(bucket_id = %bucket.id, error = %e, "Failed to record bucket usage");
                    }
                    replicas.push(StoredReplica {
                        bucket_id: bucket.id.clone(),
                        byte_size: info.byte_size,
                    });
                }
                Err(e) => {
                    tracing::warn!(bucket_id = %bucket.id, path = %path, error = %e, "Bucket write failed");
                }
            }
        }

        let stored = StoredFile {
            path,
            attempted: targets.len(),
            succeeded: replicas.len(),
            replicas,
        };

        if stored.succeeded == 0 {
            tracing::error!(path = %stored.path, attempted = stored.attempted, "Every bucket write failed");
            return Err(StorageError::AllWritesFailed {
                path: stored.path,
                attempted: stored.attempted,
            });
        }
        if !stored.is_fully_replicated() {
            tracing::warn!(
                path = %stored.path,
                attempted = stored.attempted,
                succeeded = stored.succeeded,
                "Stored below redundancy target"
            );
        }

        tracing::debug!(path = %stored.path, copies = stored.succeeded, "Stored object");
        Ok(stored)
    }

    /// Fetch a local copy, trying buckets one at a time in priority order.
    pub async fn retrieve_file(
        &self,
        path: &str,
        scope: &BucketScope,
    ) -> Result<RetrievedFile, StorageError> {
        let buckets = self.read_order(scope)?;
        let suffix = Path::new(path)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        for bucket in buckets {
            let provider = match self.provider_for(&bucket) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::warn!(bucket_id = %bucket.id, error = %e, "Skipping bucket");
                    continue;
                }
            };

            let local = tempfile::Builder::new()
                .prefix("asset-")
                .suffix(&suffix)
                .tempfile()?
                .into_temp_path();

            match provider.retrieve(&bucket, path, &local).await {
                Ok(()) => {
                    tracing::debug!(bucket_id = %bucket.id, path = %path, "Retrieved object");
                    return Ok(RetrievedFile {
                        path: local,
                        bucket_id: bucket.id,
                    });
                }
                Err(ProviderError::NotFound(_)) => {
                    tracing::debug!(bucket_id = %bucket.id, path = %path, "Object missing from bucket");
                }
                Err(e) => {
                    tracing::warn!(bucket_id = %bucket.id, path = %path, error = %e, "Bucket read failed, trying next");
                }
            }
        }

        Err(StorageError::NotFoundInAnyBucket(path.to_string()))
    }

    /// Fetch a local copy from recorded replicas, trying each location's own
    /// bucket and path in the order given.
    pub async fn retrieve_from_locations(
        &self,
        locations: &[FileLocation],
    ) -> Result<RetrievedFile, StorageError> {
        for location in locations {
            let scope = BucketScope::only([location.bucket_id.as_str()]);
            match self.retrieve_file(&location.path, &scope).await {
                Ok(file) => return Ok(file),
                Err(StorageError::NotFoundInAnyBucket(_)) => {
                    tracing::warn!(
                        bucket_id = %location.bucket_id,
                        path = %location.path,
                        "Replica unavailable, trying next location"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let path = locations
            .first()
            .map(|l| l.path.clone())
            .unwrap_or_default();
        Err(StorageError::NotFoundInAnyBucket(path))
    }

    /// Delete the object from every eligible bucket. Succeeds if any deletion did.
    pub async fn delete_file(&self, path: &str, scope: &BucketScope) -> Result<usize, StorageError> {
        let buckets = self.read_order(scope)?;
        if buckets.is_empty() {
            return Err(StorageError::NoBucketsAvailable);
        }

        let deletions = buckets.iter().map(|bucket| async move {
            let outcome = match self.provider_for(bucket) {
                Ok(provider) => provider.delete(bucket, path).await,
                Err(e) => Err(e),
            };
            (bucket, outcome)
        });

        let mut deleted = 0;
        for (bucket, outcome) in join_all(deletions).await {
            match outcome {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(bucket_id = %bucket.id, path = %path, error = %e, "Bucket delete failed");
                }
            }
        }

        if deleted == 0 {
            return Err(StorageError::AllDeletesFailed {
                path: path.to_string(),
                attempted: buckets.len(),
            });
        }
        Ok(deleted)
    }

    /// True if any eligible bucket holds the object.
    pub async fn file_exists(&self, path: &str, scope: &BucketScope) -> Result<bool, StorageError> {
        for bucket in self.read_order(scope)? {
            if self.exists_in(&bucket, path).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Public URL from the first bucket, by priority, that holds the object.
    pub async fn public_url(
        &self,
        path: &str,
        scope: &BucketScope,
    ) -> Result<Option<String>, StorageError> {
        for bucket in self.read_order(scope)? {
            if !self.exists_in(&bucket, path).await {
                continue;
            }
            if let Some(url) = self
                .provider_for(&bucket)
                .ok()
                .and_then(|provider| provider.public_url(&bucket, path))
            {
                return Ok(Some(url));
            }
        }
        Ok(None)
    }

    async fn exists_in(&self, bucket: &Bucket, path: &str) -> bool {
        let provider = match self.provider_for(bucket) {
            Ok(provider) => provider,
            Err(_) => return false,
        };
        match provider.exists(bucket, path).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(bucket_id = %bucket.id, path = %path, error = %e, "Existence check failed");
                false
            }
        }
    }

    pub fn has_provider(&self, kind: ProviderKind) -> bool {
        self.providers.get(kind).is_some()
    }

    fn provider_for(&self, bucket: &Bucket) -> Result<Arc<dyn BucketProvider>, ProviderError> {
        self.providers.get(bucket.provider).ok_or_else(|| {
            ProviderError::Backend(format!(
                "no provider registered for {:?} (bucket {})",
                bucket.provider, bucket.id
            ))
        })
    }

    /// Enabled buckets in read order: the scope's order when given, otherwise priority.
    fn read_order(&self, scope: &BucketScope) -> Result<Vec<Bucket>, StorageError> {
        let mut enabled: Vec<Bucket> = self
            .config
            .buckets()?
            .into_iter()
            .filter(|b| b.enabled)
            .collect();

        match scope.buckets {
            Some(ref wanted) => Ok(wanted
                .iter()
                .filter_map(|id| enabled.iter().find(|b| &b.id == id).cloned())
                .collect()),
            None => {
                enabled.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
                Ok(enabled)
            }
        }
    }
}

/// Choose write targets. An explicit list is intersected with the enabled
/// buckets in the caller's order; otherwise enabled buckets are ranked by
/// priority, then by most free space.
pub fn select_write_targets(
    buckets: Vec<Bucket>,
    explicit: Option<&[String]>,
    copies: usize,
) -> Vec<Bucket> {
    let mut enabled: Vec<Bucket> = buckets.into_iter().filter(|b| b.enabled).collect();

    if let Some(explicit) = explicit {
        return explicit
            .iter()
            .filter_map(|id| enabled.iter().find(|b| &b.id == id).cloned())
            .take(copies)
            .collect();
    }

    enabled.sort_by(|a, b| {
        a.priority.cmp(&b.priority).then_with(|| {
            b.free_space_ratio()
                .partial_cmp(&a.free_space_ratio())
                .unwrap_or(Ordering::Equal)
        })
    });
    enabled.truncate(copies);
    enabled
}

fn build_object_path(options: &StoreOptions) -> String {
    let file_name = options
        .file_name
        .as_deref()
        .map(sanitize_file_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let prefix = match options.path_prefix {
        Some(ref prefix) => prefix.trim_matches('/').to_string(),
        None => format!(
            "{}/{}",
            chrono::Utc::now().format("%Y/%m"),
            uuid::Uuid::new_v4()
        ),
    };

    if prefix.is_empty() {
        file_name
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Keep file names to a conservative character set.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(id: &str, priority: i32, capacity: Option<u64>, used: u64) -> Bucket {
        Bucket {
            id: id.to_string(),
            name: id.to_string(),
            provider: ProviderKind::Local,
            target: format!("/tmp/{id}"),
            priority,
            capacity_bytes: capacity,
            used_bytes: used,
            cdn_url: None,
            enabled: true,
        }
    }

    fn ids(buckets: &[Bucket]) -> Vec<&str> {
        buckets.iter().map(|b| b.id.as_str()).collect()
    }

    #[test]
    fn test_select_orders_by_priority_then_free_space() {
        let buckets = vec![
            bucket("full", 1, Some(100), 90),
            bucket("roomy", 1, Some(100), 10),
            bucket("preferred", 0, Some(100), 99),
            bucket("spare", 2, None, 0),
        ];
        let chosen = select_write_targets(buckets, None, 3);
        assert_eq!(ids(&chosen), vec!["preferred", "roomy", "full"]);
    }

    #[test]
    fn test_select_skips_disabled_buckets() {
        let mut off = bucket("off", 0, None, 0);
        off.enabled = false;
        let chosen = select_write_targets(vec![off, bucket("on", 5, None, 0)], None, 2);
        assert_eq!(ids(&chosen), vec!["on"]);
    }

    #[test]
    fn test_select_explicit_intersects_enabled() {
        let mut off = bucket("off", 0, None, 0);
        off.enabled = false;
        let buckets = vec![off, bucket("a", 0, None, 0), bucket("b", 1, None, 0)];
        let explicit = vec!["b".to_string(), "off".to_string(), "missing".to_string()];
        let chosen = select_write_targets(buckets, Some(&explicit), 5);
        assert_eq!(ids(&chosen), vec!["b"]);
    }

    #[test]
    fn test_object_path_uses_prefix() {
        let options = StoreOptions {
            path_prefix: Some("2024/05/abc/".to_string()),
            file_name: Some("photo_thumbnail.jpg".to_string()),
            ..Default::default()
        };
        assert_eq!(build_object_path(&options), "2024/05/abc/photo_thumbnail.jpg");
    }

    #[test]
    fn test_object_path_sanitizes_file_name() {
        let options = StoreOptions {
            path_prefix: Some("x".to_string()),
            file_name: Some("../../etc/pass wd".to_string()),
            ..Default::default()
        };
        assert_eq!(build_object_path(&options), "x/pass_wd");
    }

    #[test]
    fn test_generated_path_is_valid() {
        let path = build_object_path(&StoreOptions::default());
        assert!(validate_object_path(&path).is_ok());
        assert_eq!(path.split('/').count(), 4);
    }
}
