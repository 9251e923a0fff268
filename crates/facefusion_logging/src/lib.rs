//! Shared logging utilities for FaceFusion binaries.
//!
//! Tracing output goes three ways: stderr for the operator, a daily-rolling
//! file under the FaceFusion home directory, and a bounded in-process
//! broadcast channel that the log-streaming WebSocket drains.

mod broadcast;

pub use broadcast::{BroadcastLayer, LogBroadcaster, DEFAULT_LOG_QUEUE_DEPTH};

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "facefusiond=info,facefusion_orchestrator=info,facefusion_db=info";

/// Logging configuration shared by FaceFusion binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with stderr output, a rolling file writer and the
/// broadcast layer feeding `broadcaster`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(config: LogConfig<'_>, broadcaster: LogBroadcaster) -> Result<WorkerGuard> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_appender =
        tracing_appender::rolling::daily(&log_dir, format!("{}.log", config.app_name));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        env_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(BroadcastLayer::new(broadcaster).with_filter(env_filter()))
        .init();

    Ok(guard)
}

/// The FaceFusion home directory: `~/.facefusion` unless overridden.
pub fn facefusion_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FACEFUSION_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".facefusion")
}

/// The logs directory: `~/.facefusion/logs`.
pub fn logs_dir() -> PathBuf {
    facefusion_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
