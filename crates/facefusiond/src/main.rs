//! FaceFusion orchestration daemon.
//!
//! Wires the store, event bus, resource manager and orchestrator together,
//! then serves the HTTP surface until interrupted. One orchestrator value is
//! constructed here and handed by reference to every handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use facefusion_db::JobStore;
use facefusion_logging::{init_logging, LogBroadcaster, LogConfig};
use facefusion_orchestrator::{EventBus, Orchestrator, Pipeline, ResourceManager};
use facefusion_security::AllowedRoots;

use facefusiond::api::{self, AppState};
use facefusiond::config::ServerConfig;
use facefusiond::pipeline::SubprocessPipeline;

/// Exit code consumers expect on user interrupt.
const EXIT_INTERRUPTED: i32 = 130;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let broadcaster = LogBroadcaster::default();
    let _log_guard = init_logging(
        LogConfig {
            app_name: "facefusiond",
            verbose: config.verbose,
        },
        broadcaster.clone(),
    )?;

    let store = JobStore::open(&config.db_path())
        .await
        .with_context(|| format!("failed to open job store at {}", config.db_path().display()))?;
    let bus = EventBus::new();
    let resources = ResourceManager::new(config.resource_limits());
    let workspace = config.workspace_root();
    let roots = AllowedRoots::discover(&workspace, &config.jobs_path);
    let pipeline: Arc<dyn Pipeline> = Arc::new(SubprocessPipeline::new(&config.pipeline_command));

    let orchestrator = Orchestrator::new(store, bus, resources, roots.clone(), pipeline)
        .await
        .context("failed to start orchestrator")?;

    let state = AppState {
        orchestrator: orchestrator.clone(),
        broadcaster,
        roots,
        config: Arc::new(config.clone()),
    };
    let app = api::router(state);

    let listener = bind_with_fallback(&config.host, config.port).await?;
    info!(
        "facefusiond listening on {} (remote access {})",
        listener.local_addr()?,
        if config.allow_remote {
            "enabled"
        } else {
            "disabled"
        }
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    orchestrator.shutdown().await;

    if INTERRUPTED.load(Ordering::SeqCst) {
        std::process::exit(EXIT_INTERRUPTED);
    }
    Ok(())
}

/// Bind the configured port, falling back to an ephemeral one when taken.
async fn bind_with_fallback(host: &str, port: u16) -> Result<TcpListener> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!(
                "port {} unavailable ({}), falling back to an ephemeral port",
                port, err
            );
            TcpListener::bind((host, 0))
                .await
                .with_context(|| format!("failed to bind {host}"))
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        INTERRUPTED.store(true, Ordering::SeqCst);
        info!("interrupt received, shutting down");
    }
}
