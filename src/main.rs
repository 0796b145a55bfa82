use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_store::{
    api,
    config::{default_dimensions, Config},
    media::TransformTable,
    providers::{GcsProvider, LocalProvider, ProviderRegistry},
    storage::{models::ProviderKind, Database},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "asset-store starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Environment values only fill an empty configuration store
    db.seed_config(
        &config.seed_settings(),
        &config.seed_buckets(),
        &default_dimensions(),
    )?;

    // Bucket providers
    let mut providers =
        ProviderRegistry::new().with(ProviderKind::Local, Arc::new(LocalProvider::new()));
    let wants_gcs = config.storage.gcs_bucket.is_some()
        || db
            .list_buckets()?
            .iter()
            .any(|b| b.provider == ProviderKind::Gcs);
    if wants_gcs {
        let gcs = GcsProvider::new(config.storage.gcs_credentials_file.as_deref()).await?;
        providers.register(ProviderKind::Gcs, Arc::new(gcs));
        info!("GCS provider enabled");
    }

    for bucket in db.list_buckets()? {
        info!(
            bucket_id = %bucket.id,
            provider = ?bucket.provider,
            priority = bucket.priority,
            enabled = bucket.enabled,
            "Configured bucket"
        );
    }

    // Create shared state
    let transforms = TransformTable::from_config(&config.media);
    let state = Arc::new(AppState::new(config.clone(), db, providers, transforms));

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
