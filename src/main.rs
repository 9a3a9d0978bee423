mod api;
mod checker;
mod core;
mod judger;
mod languages;
mod playground;
mod runner;
mod sandbox;
mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::api::AppState;
use crate::runner::{build_runner, sandboxed, RunLimits};
use crate::sandbox::{SandboxBackend, SandboxConfig};
use crate::storage::Catalog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting grader...");

    // Load language configurations
    let languages_path = std::env::var("LANGUAGES_CONFIG").ok();
    let registry = languages::init_languages(languages_path.as_deref())?;
    info!(
        "Loaded language configurations from {}: {}",
        languages_path.as_deref().unwrap_or("embedded table"),
        registry.supported().join(", ")
    );

    // Settle the jail policy before freezing the configuration
    let sandbox_config =
        sandbox::init_config(sandboxed::resolve_isolation(SandboxConfig::from_env()?).await?)?;
    info!(
        "Sandbox config: backend={:?}, isolation={:?}, time={}ms, memory={}MB, worker_id={}",
        sandbox_config.backend,
        sandbox_config.isolation,
        sandbox_config.time_limit_ms,
        sandbox_config.memory_limit_mb,
        sandbox_config.worker_id,
    );

    if sandbox_config.backend == SandboxBackend::Isolate {
        // Fail fast when isolate is missing
        sandbox::ensure_isolate_available().await?;
        info!(
            "Confirmed isolate is available (cgroups: {})",
            sandbox::is_cgroups_available().await
        );
    }

    let catalog_path = std::env::var("CATALOG_PATH").ok();
    let catalog = Catalog::load(catalog_path.as_deref())?;

    let state = Arc::new(AppState::new(
        build_runner(sandbox_config),
        registry,
        catalog,
        RunLimits::from_config(sandbox_config),
    ));

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Grader stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
