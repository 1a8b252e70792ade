use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

mod acquisition;
mod api;
mod config;
mod error;
mod model;

use api::AppState;
use config::Config;
use model::ModelStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let source = config.build_source()?;
    match &source {
        Some(s) => info!("Model source: {}", s.name()),
        None => warn!(
            "No remote model source configured; relying on cached artifact at {}",
            config.model_path.display()
        ),
    }

    let store = Arc::new(ModelStore::new(
        config.model_path.clone(),
        source,
        config.retry_policy(),
    ));

    // Startup load is fatal on failure; lazy mode defers it to the first request.
    if config.eager_load {
        store
            .ensure_loaded()
            .await
            .context("Failed to initialize model")?;
        info!("Model initialized from {}", store.cache_path().display());
    } else {
        info!("Lazy model loading enabled; the first /predict request will load it");
    }

    let cors = api::cors_layer(&config.origins())?;
    let app = api::router(AppState { models: store }, cors);

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr()))?;
    info!("Prediction API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
