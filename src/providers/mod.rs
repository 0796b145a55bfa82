mod gcs;
mod local;

pub use gcs::GcsProvider;
pub use local::LocalProvider;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::models::{Bucket, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// What a backend reports after accepting an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    pub byte_size: u64,
}

/// Adapter for one kind of storage backend. A single adapter serves every
/// bucket of its kind; the bucket to act on is passed with each call.
#[async_trait]
pub trait BucketProvider: Send + Sync {
    /// Copy the local file at `source` to `destination` inside the bucket.
    async fn store(
        &self,
        bucket: &Bucket,
        source: &Path,
        destination: &str,
        content_type: &str,
    ) -> Result<StoreInfo, ProviderError>;

    /// Copy `remote_path` from the bucket into the local file `destination`,
    /// which the caller has already created.
    async fn retrieve(
        &self,
        bucket: &Bucket,
        remote_path: &str,
        destination: &Path,
    ) -> Result<(), ProviderError>;

    /// Remove an object. Removing an absent object is not an error.
    async fn delete(&self, bucket: &Bucket, remote_path: &str) -> Result<(), ProviderError>;

    async fn exists(&self, bucket: &Bucket, remote_path: &str) -> Result<bool, ProviderError>;

    /// Publicly reachable URL for an object, if the bucket exposes one.
    fn public_url(&self, bucket: &Bucket, remote_path: &str) -> Option<String>;
}

/// Maps each provider kind to the adapter that talks to it.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn BucketProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ProviderKind, provider: Arc<dyn BucketProvider>) -> Self {
        self.register(kind, provider);
        self
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn BucketProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn BucketProvider>> {
        self.providers.get(&kind).cloned()
    }
}

/// Open a caller-owned download target for writing. The file is never
/// created here, so a target whose guard was already dropped stays gone.
pub(crate) async fn open_destination(destination: &Path) -> Result<tokio::fs::File, ProviderError> {
    Ok(tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(destination)
        .await?)
}

/// Reject object paths that could escape a bucket root.
pub(crate) fn validate_object_path(path: &str) -> Result<(), ProviderError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(ProviderError::InvalidPath(path.to_string()));
    }
    Ok(())
}
