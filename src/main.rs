//! MindOp - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the knowledge agent API.

use mindop::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mindop=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: chat_model={}, embed_model={}, store={}, dev_mode={}",
        config.models.chat_model, config.models.embed_model, config.store.backend, config.dev_mode
    );
    if let Some(interval) = config.collab.worker_interval {
        info!("Background task worker every {:?}", interval);
    }

    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config).await?;

    Ok(())
}
