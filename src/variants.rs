//! Derivative generation for uploaded images and videos.
//!
//! Each configured dimension becomes one concurrent unit: fetch the original,
//! render, measure, replicate, record. Units share a single deadline and a
//! failed unit never fails its siblings.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::{ConfigError, ConfigProvider};
use crate::digest::sha256_file;
use crate::manager::{StorageError, StorageManager, StoreOptions};
use crate::media::{MediaTransform, TransformError, TransformTable};
use crate::server::order_locations;
use crate::storage::models::{
    Dimension, FileInstance, FileLocation, FileRecord, LocationStatus, ProcessingStatus,
    ORIGINAL_VARIANT,
};
use crate::storage::{Database, DatabaseError, RenditionOutput};

pub const DEFAULT_VARIANT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum VariantError {
    #[error("All {attempted} variants failed for file {file_id}")]
    AllVariantsFailed { file_id: String, attempted: usize },
    #[error("File {0} has no completed original")]
    MissingOriginal(String),
    #[error("Original of file {0} has no active location")]
    OriginalUnavailable(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Why a single dimension failed. Logged, then folded into the aggregate outcome.
#[derive(Debug, Error)]
enum UnitError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Wait for every unit. When false the work is spawned and an empty list returned.
    pub blocking: bool,
    /// Restrict generation to these dimension names.
    pub dimensions: Option<Vec<String>>,
    /// Deadline for the whole fan-out.
    pub timeout: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            dimensions: None,
            timeout: None,
        }
    }
}

#[derive(Clone)]
pub struct VariantGenerator {
    manager: Arc<StorageManager>,
    db: Database,
    config: Arc<dyn ConfigProvider>,
    transforms: TransformTable,
    default_timeout: Duration,
}

/// Everything one dimension needs, owned so it can move into a task.
struct VariantUnit {
    manager: Arc<StorageManager>,
    db: Database,
    transform: Arc<dyn MediaTransform>,
    sources: Vec<FileLocation>,
    prefix: String,
    stem: String,
    dimension: Dimension,
    instance_id: String,
}

impl VariantGenerator {
    pub fn new(
        manager: Arc<StorageManager>,
        db: Database,
        config: Arc<dyn ConfigProvider>,
        transforms: TransformTable,
    ) -> Self {
        Self {
            manager,
            db,
            config,
            transforms,
            default_timeout: DEFAULT_VARIANT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Render every configured dimension of `file` and record the results.
    ///
    /// Files that are neither images nor videos, and any file while automatic
    /// generation is switched off, yield an empty list.
    pub async fn generate_variants(
        &self,
        file: &FileRecord,
        options: GenerateOptions,
    ) -> Result<Vec<FileInstance>, VariantError> {
        if !file.file_type.supports_variants() {
            return Ok(Vec::new());
        }
        if !self.config.settings()?.auto_generate_variants {
            tracing::debug!(file_id = %file.id, "Automatic variant generation is disabled");
            return Ok(Vec::new());
        }

        if !options.blocking {
            let generator = self.clone();
            let file = file.clone();
            tokio::spawn(async move {
                if let Err(e) = generator.run(&file, &options).await {
                    tracing::error!(file_id = %file.id, error = %e, "Background variant generation failed");
                }
            });
            return Ok(Vec::new());
        }

        self.run(file, &options).await
    }

    async fn run(
        &self,
        file: &FileRecord,
        options: &GenerateOptions,
    ) -> Result<Vec<FileInstance>, VariantError> {
        let Some(transform) = self.transforms.for_kind(file.file_type) else {
            tracing::warn!(file_id = %file.id, file_type = %file.file_type.as_str(), "No transform registered");
            return Ok(Vec::new());
        };

        let dimensions = self.resolve_dimensions(file, options.dimensions.as_deref())?;
        if dimensions.is_empty() {
            return Ok(Vec::new());
        }

        let original = self
            .db
            .find_instance(&file.id, ORIGINAL_VARIANT)?
            .filter(|i| i.processing_status == ProcessingStatus::Completed)
            .ok_or_else(|| VariantError::MissingOriginal(file.id.clone()))?;
        let sources: Vec<FileLocation> = self
            .db
            .locations_for_instance(&original.id)?
            .into_iter()
            .filter(|l| l.status == LocationStatus::Active && !l.path.is_empty())
            .collect();
        let sources = order_locations(sources, &self.config.buckets()?);
        let Some(first) = sources.first() else {
            return Err(VariantError::OriginalUnavailable(file.id.clone()));
        };
        let prefix = parent_dir(&first.path);
        let stem = file_stem(&file.original_filename);

        // Placeholders first, so every attempt is visible even if the process dies.
        let mut units = Vec::with_capacity(dimensions.len());
        for dimension in dimensions {
            let placeholder = placeholder_instance(file, &original, &dimension);
            self.db.put_instance(&placeholder)?;
            units.push(VariantUnit {
                manager: self.manager.clone(),
                db: self.db.clone(),
                transform: transform.clone(),
                sources: sources.clone(),
                prefix: prefix.clone(),
                stem: stem.clone(),
                dimension,
                instance_id: placeholder.id,
            });
        }

        let attempted = units.len();
        let mut outstanding: HashSet<String> = units.iter().map(|u| u.instance_id.clone()).collect();
        let mut completed = Vec::new();

        let deadline = Instant::now() + options.timeout.unwrap_or(self.default_timeout);
        let mut set = JoinSet::new();
        for unit in units {
            set.spawn(async move {
                let result = unit.run().await;
                (unit.instance_id, unit.dimension.name, result)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => {
                    self.collect(file, joined, &mut outstanding, &mut completed);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        file_id = %file.id,
                        pending = outstanding.len(),
                        "Variant generation timed out, aborting remaining units"
                    );
                    set.abort_all();
                    // Aborted units unwind here; their temp files and child processes go with them.
                    while let Some(joined) = set.join_next().await {
                        self.collect(file, joined, &mut outstanding, &mut completed);
                    }
                    break;
                }
            }
        }

        for instance_id in &outstanding {
            self.mark_failed(file, instance_id);
        }

        if completed.is_empty() {
            tracing::error!(file_id = %file.id, attempted, "Every variant failed");
            return Err(VariantError::AllVariantsFailed {
                file_id: file.id.clone(),
                attempted,
            });
        }

        tracing::info!(
            file_id = %file.id,
            attempted,
            completed = completed.len(),
            "Variant generation finished"
        );
        Ok(completed)
    }

    fn collect(
        &self,
        file: &FileRecord,
        joined: Result<(String, String, Result<FileInstance, UnitError>), tokio::task::JoinError>,
        outstanding: &mut HashSet<String>,
        completed: &mut Vec<FileInstance>,
    ) {
        match joined {
            Ok((instance_id, dimension, Ok(instance))) => {
                tracing::debug!(file_id = %file.id, dimension = %dimension, "Variant completed");
                outstanding.remove(&instance_id);
                completed.push(instance);
            }
            Ok((instance_id, dimension, Err(e))) => {
                tracing::error!(file_id = %file.id, dimension = %dimension, error = %e, "Variant failed");
                outstanding.remove(&instance_id);
                self.mark_failed(file, &instance_id);
            }
            // Cancelled or panicked; the placeholder stays outstanding and is failed later.
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(file_id = %file.id, error = %e, "Variant task panicked");
            }
        }
    }

    fn mark_failed(&self, file: &FileRecord, instance_id: &str) {
        if let Err(e) = self
            .db
            .set_instance_status(instance_id, ProcessingStatus::Failed)
        {
            tracing::warn!(file_id = %file.id, instance_id = %instance_id, error = %e, "Could not mark variant failed");
        }
    }

    /// Configured dimensions for the file's kind, minus the original, narrowed
    /// to `subset` when one is given.
    fn resolve_dimensions(
        &self,
        file: &FileRecord,
        subset: Option<&[String]>,
    ) -> Result<Vec<Dimension>, VariantError> {
        let mut dimensions: Vec<Dimension> = self
            .config
            .dimensions(file.file_type)?
            .into_iter()
            .filter(|d| d.name != ORIGINAL_VARIANT)
            .collect();

        if let Some(subset) = subset {
            for name in subset {
                if !dimensions.iter().any(|d| &d.name == name) {
                    tracing::warn!(file_id = %file.id, dimension = %name, "Requested dimension is not configured");
                }
            }
            dimensions.retain(|d| subset.contains(&d.name));
        }
        Ok(dimensions)
    }
}

impl VariantUnit {
    async fn run(&self) -> Result<FileInstance, UnitError> {
        self.db
            .set_instance_status(&self.instance_id, ProcessingStatus::Processing)?;

        let original = self.manager.retrieve_from_locations(&self.sources).await?;
        let rendition = self.transform.render(&original.path, &self.dimension).await?;
        let (checksum, byte_size) = sha256_file(&rendition.path).await?;

        let short_id: String = self.instance_id.chars().take(8).collect();
        let stored = self
            .manager
            .store_file(
                &rendition.path,
                StoreOptions {
                    path_prefix: Some(self.prefix.clone()),
                    file_name: Some(format!(
                        "{}_{}_{short_id}.{}",
                        self.stem, self.dimension.name, rendition.extension
                    )),
                    content_type: Some(rendition.mime_type.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let now = Utc::now();
        let locations: Vec<FileLocation> = stored
            .replicas
            .iter()
            .map(|replica| FileLocation {
                instance_id: self.instance_id.clone(),
                bucket_id: replica.bucket_id.clone(),
                path: stored.path.clone(),
                status: LocationStatus::Active,
                priority: 0,
                last_verified_at: Some(now),
            })
            .collect();

        let output = RenditionOutput {
            mime_type: rendition.mime_type.clone(),
            extension: rendition.extension.clone(),
            checksum,
            byte_size,
            width: Some(rendition.width),
            height: Some(rendition.height),
        };
        Ok(self
            .db
            .complete_instance(&self.instance_id, &output, &locations)?)
    }
}

fn placeholder_instance(file: &FileRecord, original: &FileInstance, dimension: &Dimension) -> FileInstance {
    let extension = dimension
        .format
        .as_deref()
        .map(|f| f.trim_start_matches('.').to_ascii_lowercase())
        .unwrap_or_else(|| original.extension.clone());
    let mime_type = mime_guess::from_ext(&extension)
        .first_or_octet_stream()
        .to_string();

    FileInstance {
        id: uuid::Uuid::new_v4().to_string(),
        file_id: file.id.clone(),
        variant_name: dimension.name.clone(),
        mime_type,
        extension,
        checksum: None,
        byte_size: 0,
        width: None,
        height: None,
        processing_status: ProcessingStatus::Pending,
        created_at: Utc::now(),
    }
}

fn parent_dir(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default()
}

fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("2024/05/abc/photo.jpg"), "2024/05/abc");
        assert_eq!(parent_dir("photo.jpg"), "");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("holiday.photo.png"), "holiday.photo");
        assert_eq!(file_stem("noext"), "noext");
        assert_eq!(file_stem(""), "file");
    }
}
