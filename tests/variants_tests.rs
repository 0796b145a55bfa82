use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use asset_store::config::default_dimensions;
use asset_store::ingest::{IngestService, IngestedFile, UploadRequest};
use asset_store::manager::StorageManager;
use asset_store::media::{MediaTransform, Rendition, TransformError, TransformTable};
use asset_store::providers::{LocalProvider, ProviderRegistry};
use asset_store::storage::models::{
    Bucket, Dimension, FileInstance, FileRecord, LocationStatus, MediaKind, ProcessingStatus,
    ProviderKind, StorageSettings,
};
use asset_store::storage::Database;
use asset_store::variants::{GenerateOptions, VariantError, VariantGenerator};

/// Stands in for ImageMagick and FFmpeg. Media files hold their own size as
/// `WxH` text and renditions are written the same way.
#[derive(Default)]
struct FakeTransform {
    failing: HashSet<String>,
    slow: HashSet<String>,
    outputs: Mutex<Vec<PathBuf>>,
}

impl FakeTransform {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn slow(names: &[&str]) -> Self {
        Self {
            slow: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }
}

fn read_size(path: &Path) -> Result<(u32, u32), TransformError> {
    let text = std::fs::read_to_string(path)?;
    let (w, h) = text
        .trim()
        .split_once('x')
        .ok_or_else(|| TransformError::Unsupported(text.clone()))?;
    let w = w.parse().map_err(|_| TransformError::Unsupported(text.clone()))?;
    let h = h.parse().map_err(|_| TransformError::Unsupported(text.clone()))?;
    Ok((w, h))
}

#[async_trait]
impl MediaTransform for FakeTransform {
    async fn render(&self, source: &Path, dimension: &Dimension) -> Result<Rendition, TransformError> {
        if self.slow.contains(&dimension.name) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.failing.contains(&dimension.name) {
            return Err(TransformError::ToolFailed {
                tool: "fake".to_string(),
                status: Some(1),
                output: format!("cannot render {}", dimension.name),
            });
        }

        let (src_w, src_h) = read_size(source)?;
        let (width, height) = match (dimension.width, dimension.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, src_h * w / src_w),
            (None, Some(h)) => (src_w * h / src_h, h),
            (None, None) => (src_w, src_h),
        };

        let extension = dimension.format.clone().unwrap_or_else(|| {
            source
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "bin".to_string())
        });
        let path = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()?
            .into_temp_path();
        std::fs::write(&path, format!("{width}x{height}"))?;
        self.outputs.lock().unwrap().push(path.to_path_buf());

        Ok(Rendition {
            path,
            width,
            height,
            mime_type: mime_guess::from_ext(&extension)
                .first_or_octet_stream()
                .to_string(),
            extension,
        })
    }

    async fn read_dimensions(&self, path: &Path) -> Result<(u32, u32), TransformError> {
        read_size(path)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    db: Database,
    transform: Arc<FakeTransform>,
    ingest: IngestService,
    generator: VariantGenerator,
}

impl Harness {
    fn new(transform: FakeTransform) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data")).unwrap();
        let buckets: Vec<Bucket> = (0..2)
            .map(|i| Bucket {
                id: format!("b{i}"),
                name: format!("bucket {i}"),
                provider: ProviderKind::Local,
                target: dir.path().join(format!("b{i}")).to_string_lossy().to_string(),
                priority: i,
                capacity_bytes: None,
                used_bytes: 0,
                cdn_url: None,
                enabled: true,
            })
            .collect();
        db.seed_config(&StorageSettings::default(), &buckets, &default_dimensions())
            .unwrap();

        let transform = Arc::new(transform);
        let transforms = TransformTable::new(Some(transform.clone()), Some(transform.clone()));
        let registry =
            ProviderRegistry::new().with(ProviderKind::Local, Arc::new(LocalProvider::new()));
        let manager = Arc::new(StorageManager::new(Arc::new(db.clone()), registry));

        Self {
            ingest: IngestService::new(manager.clone(), db.clone(), transforms.clone()),
            generator: VariantGenerator::new(manager, db.clone(), Arc::new(db.clone()), transforms),
            dir,
            db,
            transform,
        }
    }

    async fn upload(&self, filename: &str, contents: &str) -> IngestedFile {
        let source = self.dir.path().join(format!("upload-{filename}"));
        std::fs::write(&source, contents).unwrap();
        self.ingest
            .ingest(
                &source,
                UploadRequest {
                    original_filename: filename.to_string(),
                    mime_type: None,
                    owner_id: None,
                },
            )
            .await
            .unwrap()
    }

    fn variant(&self, file: &FileRecord, name: &str) -> FileInstance {
        self.db.find_instance(&file.id, name).unwrap().unwrap()
    }

    fn stored_contents(&self, instance: &FileInstance) -> String {
        let locations = self.db.locations_for_instance(&instance.id).unwrap();
        let first = locations
            .iter()
            .find(|l| l.status == LocationStatus::Active)
            .unwrap();
        std::fs::read_to_string(self.dir.path().join(&first.bucket_id).join(&first.path)).unwrap()
    }
}

fn names(instances: &[FileInstance]) -> Vec<String> {
    let mut names: Vec<String> = instances.iter().map(|i| i.variant_name.clone()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_image_variants_follow_dimensions() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("photo.jpg", "1200x900").await;
    assert_eq!(uploaded.original.width, Some(1200));
    assert_eq!(uploaded.original.height, Some(900));

    let variants = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&variants), vec!["medium", "thumbnail"]);

    let thumbnail = h.variant(&uploaded.file, "thumbnail");
    assert_eq!(thumbnail.processing_status, ProcessingStatus::Completed);
    assert_eq!((thumbnail.width, thumbnail.height), (Some(150), Some(150)));
    assert_eq!(thumbnail.extension, "jpg");
    assert_eq!(thumbnail.mime_type, "image/jpeg");
    assert!(thumbnail.checksum.is_some());
    assert_eq!(thumbnail.byte_size, "150x150".len() as u64);
    assert_eq!(h.stored_contents(&thumbnail), "150x150");

    let medium = h.variant(&uploaded.file, "medium");
    assert_eq!((medium.width, medium.height), (Some(800), Some(600)));
    assert_eq!(h.stored_contents(&medium), "800x600");

    // Replicated like the original, alongside it
    let locations = h.db.locations_for_instance(&medium.id).unwrap();
    assert_eq!(locations.len(), 2);
    let original_dir = uploaded.stored.path.rsplit_once('/').unwrap().0;
    assert!(locations[0].path.starts_with(original_dir));
    assert!(locations[0].path.contains("photo_medium_"));
}

#[tokio::test]
async fn test_video_variants_use_video_dimensions() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("clip.mp4", "1920x1080").await;
    assert_eq!(uploaded.file.file_type, MediaKind::Video);

    let variants = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&variants), vec!["720p", "video_thumbnail"]);

    let hd = h.variant(&uploaded.file, "720p");
    assert_eq!((hd.width, hd.height), (Some(1280), Some(720)));
    assert_eq!(hd.extension, "mp4");

    let poster = h.variant(&uploaded.file, "video_thumbnail");
    assert_eq!(poster.extension, "jpg");
    assert_eq!(poster.mime_type, "image/jpeg");
}

#[tokio::test]
async fn test_other_files_get_no_variants() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("notes.txt", "plain words").await;
    assert_eq!(uploaded.file.file_type, MediaKind::Other);

    let variants = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();
    assert!(variants.is_empty());
    assert_eq!(h.db.instances_for_file(&uploaded.file.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_generation_is_a_no_op() {
    let h = Harness::new(FakeTransform::default());
    h.db.put_settings(&StorageSettings {
        redundancy_copies: 2,
        auto_generate_variants: false,
    })
    .unwrap();
    let uploaded = h.upload("photo.png", "400x400").await;

    let variants = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();
    assert!(variants.is_empty());
    assert_eq!(h.db.instances_for_file(&uploaded.file.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_all_variants_failing() {
    let h = Harness::new(FakeTransform::failing(&["thumbnail", "medium"]));
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    let err = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VariantError::AllVariantsFailed { attempted: 2, .. }));

    for name in ["thumbnail", "medium"] {
        let instance = h.variant(&uploaded.file, name);
        assert_eq!(instance.processing_status, ProcessingStatus::Failed, "{name}");
        assert!(h.db.locations_for_instance(&instance.id).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_one_failure_does_not_fail_siblings() {
    let h = Harness::new(FakeTransform::failing(&["medium"]));
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    let variants = h
        .generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&variants), vec!["thumbnail"]);
    assert_eq!(
        h.variant(&uploaded.file, "medium").processing_status,
        ProcessingStatus::Failed
    );
    assert_eq!(
        h.variant(&uploaded.file, "thumbnail").processing_status,
        ProcessingStatus::Completed
    );
}

#[tokio::test]
async fn test_timeout_fails_unfinished_units() {
    let h = Harness::new(FakeTransform::slow(&["medium"]));
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    let variants = h
        .generator
        .generate_variants(
            &uploaded.file,
            GenerateOptions {
                timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(names(&variants), vec!["thumbnail"]);

    let medium = h.variant(&uploaded.file, "medium");
    assert_eq!(medium.processing_status, ProcessingStatus::Failed);
    assert!(h.db.locations_for_instance(&medium.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_dimension_subset() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    let variants = h
        .generator
        .generate_variants(
            &uploaded.file,
            GenerateOptions {
                dimensions: Some(vec!["medium".to_string(), "poster".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(names(&variants), vec!["medium"]);
    assert!(h.db.find_instance(&uploaded.file.id, "thumbnail").unwrap().is_none());
}

#[tokio::test]
async fn test_regeneration_adds_fresh_instances() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("photo.jpg", "1200x900").await;
    let options = || GenerateOptions {
        dimensions: Some(vec!["thumbnail".to_string()]),
        ..Default::default()
    };

    let first = h
        .generator
        .generate_variants(&uploaded.file, options())
        .await
        .unwrap();
    let second = h
        .generator
        .generate_variants(&uploaded.file, options())
        .await
        .unwrap();
    assert_ne!(first[0].id, second[0].id);

    // Each run writes its own object
    let first_path = &h.db.locations_for_instance(&first[0].id).unwrap()[0].path;
    let second_path = &h.db.locations_for_instance(&second[0].id).unwrap()[0].path;
    assert_ne!(first_path, second_path);
}

#[tokio::test]
async fn test_renditions_are_cleaned_up() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    h.generator
        .generate_variants(&uploaded.file, GenerateOptions::default())
        .await
        .unwrap();

    let outputs = h.transform.outputs.lock().unwrap().clone();
    assert_eq!(outputs.len(), 2);
    for path in outputs {
        assert!(!path.exists(), "{} was left behind", path.display());
    }
}

#[tokio::test]
async fn test_non_blocking_returns_immediately() {
    let h = Harness::new(FakeTransform::default());
    let uploaded = h.upload("photo.jpg", "1200x900").await;

    let variants = h
        .generator
        .generate_variants(
            &uploaded.file,
            GenerateOptions {
                blocking: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(variants.is_empty());

    let mut completed = 0;
    for _ in 0..100 {
        completed = h
            .db
            .instances_for_file(&uploaded.file.id)
            .unwrap()
            .iter()
            .filter(|i| !i.is_original() && i.processing_status == ProcessingStatus::Completed)
            .count();
        if completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_missing_original() {
    let h = Harness::new(FakeTransform::default());
    let file = FileRecord {
        id: "orphan".to_string(),
        owner_id: None,
        file_type: MediaKind::Image,
        original_filename: "orphan.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        extension: "jpg".to_string(),
        created_at: chrono::Utc::now(),
        deleted_at: None,
    };
    h.db.put_file(&file).unwrap();

    let err = h
        .generator
        .generate_variants(&file, GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VariantError::MissingOriginal(_)));
}
