use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{open_destination, validate_object_path, BucketProvider, ProviderError, StoreInfo};
use crate::storage::models::Bucket;

/// Local filesystem buckets. Each bucket's `target` is its root directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }

    fn object_path(bucket: &Bucket, key: &str) -> Result<PathBuf, ProviderError> {
        validate_object_path(key)?;
        Ok(Path::new(&bucket.target).join(key))
    }
}

#[async_trait]
impl BucketProvider for LocalProvider {
    async fn store(
        &self,
        bucket: &Bucket,
        source: &Path,
        destination: &str,
        _content_type: &str,
    ) -> Result<StoreInfo, ProviderError> {
        let path = Self::object_path(bucket, destination)?;
        let parent = path.parent().unwrap_or_else(|| Path::new(&bucket.target));
        tokio::fs::create_dir_all(parent).await?;

        // Staged beside the target and renamed so readers never see a partial
        // object. The guard removes the staging file if this future is dropped.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (staging_file, staging) = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".part")
            .tempfile_in(parent)?
            .into_parts();

        let mut input = tokio::fs::File::open(source).await?;
        let mut output = tokio::fs::File::from_std(staging_file);
        let byte_size = tokio::io::copy(&mut input, &mut output).await?;
        output.flush().await?;
        drop(output);

        staging.persist(&path).map_err(|e| e.error)?;

        Ok(StoreInfo { byte_size })
    }

    async fn retrieve(
        &self,
        bucket: &Bucket,
        remote_path: &str,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        let path = Self::object_path(bucket, remote_path)?;
        let mut input = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(remote_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut output = open_destination(destination).await?;
        tokio::io::copy(&mut input, &mut output).await?;
        output.flush().await?;
        Ok(())
    }

    async fn delete(&self, bucket: &Bucket, remote_path: &str) -> Result<(), ProviderError> {
        let path = Self::object_path(bucket, remote_path)?;
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn exists(&self, bucket: &Bucket, remote_path: &str) -> Result<bool, ProviderError> {
        let path = Self::object_path(bucket, remote_path)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn public_url(&self, bucket: &Bucket, remote_path: &str) -> Option<String> {
        bucket
            .cdn_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), remote_path))
    }
}
