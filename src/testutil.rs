//! Shared test helpers for asset-store router tests.

use std::sync::Arc;

use crate::config::{default_dimensions, Config, MediaConfig, NodeConfig, StorageConfig};
use crate::media::TransformTable;
use crate::providers::{LocalProvider, ProviderRegistry};
use crate::storage::models::{Bucket, ProviderKind, StorageSettings};
use crate::storage::Database;
use crate::AppState;

pub const TEST_SECRET: &str = "test-secret";

/// Two local buckets under `temp_dir`, primary first.
pub fn test_buckets(temp_dir: &tempfile::TempDir) -> Vec<Bucket> {
    ["primary", "secondary"]
        .iter()
        .enumerate()
        .map(|(i, name)| Bucket {
            id: (*name).to_string(),
            name: (*name).to_string(),
            provider: ProviderKind::Local,
            target: temp_dir.path().join(name).to_string_lossy().to_string(),
            priority: i as i32,
            capacity_bytes: None,
            used_bytes: 0,
            cdn_url: None,
            enabled: true,
        })
        .collect()
}

/// Create a test AppState with a temporary database and two local buckets.
/// No media tools are wired in, so uploads never spawn subprocesses.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        storage: StorageConfig::default(),
        media: MediaConfig::default(),
        signing_secret: Some(TEST_SECRET.to_string()),
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    db.seed_config(
        &StorageSettings::default(),
        &test_buckets(temp_dir),
        &default_dimensions(),
    )
    .expect("Failed to seed test configuration");

    let providers = ProviderRegistry::new().with(ProviderKind::Local, Arc::new(LocalProvider::new()));
    Arc::new(AppState::new(
        config,
        db,
        providers,
        TransformTable::default(),
    ))
}
