//! Job pipeline worker binary
//!
//! Run with: cargo run -p doc-pipeline --bin doc-pipeline-worker -- [config.toml]

use anyhow::Context;
use doc_pipeline::{
    config::PipelineConfig,
    executors::ExecutorRegistry,
    processing::{Dispatcher, Health},
    storage::SqliteJobStore,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args_os().nth(1) {
        Some(path) => PipelineConfig::from_file(&path)
            .with_context(|| format!("loading {}", std::path::Path::new(&path).display()))?,
        None => PipelineConfig::default(),
    };

    tracing::info!("Configuration loaded");
    tracing::info!("  - Pool size: {}", config.pool_size());
    tracing::info!("  - Max pending: {}", config.max_pending);
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Artifacts: {}", config.storage.artifact_root.display());

    let store = SqliteJobStore::open(&config.storage.database_path, config.max_pending)
        .context("opening job store")?;
    let registry = ExecutorRegistry::with_defaults(&config.tools)?;
    let dispatcher = Dispatcher::new(Arc::new(store), registry, &config);

    let runner = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });

    println!("\nWorker {} running. Press Ctrl+C to stop\n", dispatcher.worker_id());

    let mut health = dispatcher.subscribe_health();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, finishing in-flight jobs");
            dispatcher.shutdown();
        }
        _ = health.wait_for(|h| matches!(h, Health::Unhealthy(_))) => {}
    }

    runner.await.context("dispatcher task panicked")??;
    Ok(())
}
