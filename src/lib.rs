//! asset-store - Replicated media asset storage
//!
//! This crate stores uploaded files redundantly across several buckets and serves them back with:
//! - Pluggable bucket providers (local filesystem, GCS) with concurrent replicated writes
//! - Priority-ordered failover reads
//! - Image and video variants rendered through ImageMagick and FFmpeg
//! - HTTP Range serving behind short signed URLs
//! - redb embedded database for metadata and live configuration

pub mod api;
pub mod config;
pub mod digest;
pub mod ingest;
pub mod manager;
pub mod media;
pub mod providers;
pub mod server;
pub mod signer;
pub mod storage;
pub mod variants;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::{Config, ConfigProvider};
use ingest::IngestService;
use manager::StorageManager;
use media::TransformTable;
use providers::ProviderRegistry;
use server::FileServer;
use signer::UrlSigner;
use storage::Database;
use variants::VariantGenerator;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub manager: Arc<StorageManager>,
    pub ingest: IngestService,
    pub variants: VariantGenerator,
    pub server: FileServer,
    pub signer: UrlSigner,
}

impl AppState {
    /// Wire every component to the same database, which also serves as the
    /// live configuration source.
    pub fn new(
        config: Config,
        db: Database,
        providers: ProviderRegistry,
        transforms: TransformTable,
    ) -> Self {
        let live: Arc<dyn ConfigProvider> = Arc::new(db.clone());
        let manager = Arc::new(StorageManager::new(live.clone(), providers));

        let ingest = IngestService::new(manager.clone(), db.clone(), transforms.clone());
        let variants = VariantGenerator::new(manager.clone(), db.clone(), live.clone(), transforms)
            .with_timeout(config.media.variant_timeout);
        let server = FileServer::new(db.clone(), live, manager.clone());
        let signer = UrlSigner::new(config.signing_secret.clone());

        Self {
            config,
            db,
            manager,
            ingest,
            variants,
            server,
            signer,
        }
    }
}
