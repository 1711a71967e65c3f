use anyhow::{Context, Result};
use facewatch_core::{FaceAnalyzer, FaceStore, OnnxAnalyzer};
use facewatch_hw::{DefaultOpener, SourceSpec};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod api;
mod cache;
mod capture;
mod config;
mod control;
mod events;
mod publisher;

use api::AppState;
use cache::FaceCache;
use capture::{CaptureLoop, CaptureSupervisor, SharedAnalyzer};
use config::Config;
use control::ControlPath;
use publisher::Publisher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facewatchd starting");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        source = %SourceSpec::parse(&config.video_source),
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    // Fail fast if the models are missing or broken.
    let analyzer = OnnxAnalyzer::from_model_dir(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(analyzer) as Box<dyn FaceAnalyzer>));

    let store = FaceStore::new(&config.db_path);
    let cache = Arc::new(FaceCache::load(&store).context("failed to load face database")?);
    tracing::info!(people = cache.current().len(), "face database ready");

    let publisher = Publisher::new(config.channel_capacity, config.jpeg_quality);
    let cancel = CancellationToken::new();

    let capture = CaptureLoop::new(
        Box::new(DefaultOpener::new(SourceSpec::parse(&config.video_source))),
        Arc::clone(&analyzer),
        Arc::clone(&cache),
        publisher.clone(),
        cancel.clone(),
        tokio::runtime::Handle::current(),
    );

    let state = Arc::new(AppState {
        control: ControlPath::new(store, cache, analyzer, publisher.clone()),
        publisher,
        capture: Arc::new(CaptureSupervisor::new(capture)),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "facewatchd ready");

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("facewatchd shutting down");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    cancel.cancel();
    Ok(())
}
