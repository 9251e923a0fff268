//! Daemon configuration from flags and environment knobs.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use facefusion_orchestrator::ResourceLimits;

/// FaceFusion job orchestration daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "facefusiond", version, about)]
pub struct ServerConfig {
    /// API bind host. Loopback by default.
    #[arg(long, env = "FACEFUSION_API_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// API port. Falls back to an ephemeral port when taken.
    #[arg(long, env = "FACEFUSION_API_PORT", default_value_t = 8002)]
    pub port: u16,

    /// UI dev-server port, used for the default CORS origins.
    #[arg(long, env = "FACEFUSION_UI_PORT", default_value_t = 5173)]
    pub ui_port: u16,

    /// Serve non-loopback clients (truthy: 1, true, yes).
    #[arg(
        long,
        env = "FACEFUSION_ALLOW_REMOTE",
        default_value = "0",
        value_parser = parse_truthy,
        action = clap::ArgAction::Set
    )]
    pub allow_remote: bool,

    /// Comma-separated CORS origins. Defaults to the local UI origins.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Directory holding orchestrator state (`orchestrator.db`).
    #[arg(long, env = "FACEFUSION_JOBS_PATH", default_value = ".jobs")]
    pub jobs_path: PathBuf,

    /// Workspace root for path validation. Defaults to the working directory.
    #[arg(long, env = "FACEFUSION_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Command line launched as the media pipeline worker.
    #[arg(
        long,
        env = "FACEFUSION_PIPELINE_CMD",
        default_value = "python3 faceforge.py run"
    )]
    pub pipeline_command: String,

    /// Concurrent GPU-heavy jobs.
    #[arg(long, default_value_t = 1)]
    pub max_gpu_jobs: usize,

    /// Concurrent encoder/decoder processes.
    #[arg(long, default_value_t = 2)]
    pub max_ffmpeg_processes: usize,

    /// Worker pool size (clamped to the host CPU count).
    #[arg(long, default_value_t = 4)]
    pub max_cpu_workers: usize,

    /// Max seconds a job waits for a GPU slot.
    #[arg(long, default_value_t = 3600)]
    pub gpu_timeout_seconds: u64,

    /// Verbose console logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerConfig {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_gpu_jobs: self.max_gpu_jobs,
            max_ffmpeg_processes: self.max_ffmpeg_processes,
            max_cpu_workers: self.max_cpu_workers,
            gpu_timeout: Duration::from_secs(self.gpu_timeout_seconds),
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn db_path(&self) -> PathBuf {
        self.jobs_path.join("orchestrator.db")
    }

    /// Configured CORS origins, or the local UI defaults.
    pub fn cors_origins(&self) -> Vec<String> {
        if self.cors_origins.is_empty() {
            vec![
                format!("http://localhost:{}", self.ui_port),
                format!("http://127.0.0.1:{}", self.ui_port),
            ]
        } else {
            self.cors_origins
                .iter()
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        }
    }
}

fn parse_truthy(raw: &str) -> Result<bool, String> {
    Ok(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}
