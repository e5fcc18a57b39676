//! attune-server: run the ingest service until interrupted.
//!
//! Configuration comes from `attune.toml` (or `ATTUNE_CONFIG`) with
//! environment overrides (`PORT`, `STORE_URL`, `STORE_SERVICE_KEY`,
//! `DEV_USER_ID`, `ANALYZER_URL`). Exits non-zero on a bind failure or an
//! unrecoverable config error at startup.

use attune::pipeline::RemoteAnalyzer;
use attune::{Clock, Service, ServiceConfig, SpeechAnalyzer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::load().map_err(|e| anyhow::anyhow!("config error: {e}"))?;

    let analyzer: Arc<dyn SpeechAnalyzer> = Arc::new(
        RemoteAnalyzer::new(&config.analyzer)
            .map_err(|e| anyhow::anyhow!("analyzer setup failed: {e}"))?,
    );

    let mut service = Service::start(config, analyzer, Clock::system())
        .await
        .map_err(|e| {
            tracing::error!("startup failed: {e}");
            anyhow::anyhow!("startup failed: {e}")
        })?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    service.shutdown().await;

    tracing::info!("attune-server shut down cleanly");
    Ok(())
}
