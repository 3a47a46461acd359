use anyhow::{Context, Result};
use facemem_core::{EmbeddingStore, OnnxEmbedder, EMBEDDING_DIM};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        model_dir = %config.model_dir.display(),
        embeddings = %config.embeddings_path.display(),
        labels = %config.labels_path.display(),
        "facememd starting"
    );

    // Fail fast: no models, no daemon.
    let embedder = OnnxEmbedder::load(&config.model_dir)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;

    let store = EmbeddingStore::open(config.persistence(), EMBEDDING_DIM)
        .context("opening face store")?
        .into_shared();

    let state = api::AppState::new(store, Arc::new(embedder), config.thresholds);
    let app = api::router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "facememd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("facememd shutting down");
    Ok(())
}
