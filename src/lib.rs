pub mod api;
pub mod config;
pub mod core_state;
pub mod db;
pub mod inference_service;
pub mod models;
pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::core_state::{CoreError, CoreState};

/// How long shutdown waits for cancelled runs to park their documents.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Start the service and block until Ctrl-C.
pub async fn run() -> Result<(), CoreError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = AppConfig::from_env()?;
    let bind_addr = config.bind_addr;
    let core = Arc::new(CoreState::open(config)?);

    let paused = core.orchestrator().recover_interrupted()?;
    if !paused.is_empty() {
        tracing::warn!(runs = ?paused, "Runs interrupted by a previous shutdown were paused");
    }

    if !core.gateway().is_alive().await {
        tracing::warn!(
            url = %core.config.ollama_url,
            "Ollama is not reachable; runs cannot start until it is"
        );
    }

    let server = api::start_server(core.clone(), bind_addr).await?;
    tracing::info!(addr = %server.local_addr, "Listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");

    let cancelled = core.orchestrator().cancel_all();
    server.stop().await;
    drain(&core, &cancelled).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// `RUST_LOG` directives when they parse, the build's default otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(config::default_log_filter()))
}

async fn drain(core: &CoreState, runs: &[String]) {
    let orchestrator = core.orchestrator();
    let waited = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while runs.iter().any(|id| orchestrator.is_active(id)) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if waited.is_err() {
        tracing::warn!("Runs still active after drain timeout; they will be paused on next start");
    }
}
