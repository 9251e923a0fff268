//! Guest-process adapter for the external media pipeline.
//!
//! The pipeline worker runs as a subprocess: it receives the job
//! configuration as JSON on stdin and reports back over a line-oriented
//! sideband on stdout (`progress <phase> <fraction>` and
//! `log <level> <message>`). The exit status is the pipeline result.
//! Cancellation is cooperative: the adapter polls the job's cancel flag
//! between lines and kills the guest when it flips.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use tracing::{debug, warn};

use facefusion_orchestrator::{JobContext, Pipeline};
use facefusion_protocol::JobConfig;

/// Poll interval for cancellation checks while the guest is quiet.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One parsed sideband report from the guest process.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineReport {
    Progress { phase: String, fraction: f32 },
    Log { level: String, message: String },
}

/// Parse one stdout line from the guest. Unknown lines are ignored.
pub fn parse_report(line: &str) -> Option<PipelineReport> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "progress" => {
            let phase = parts.next()?.to_string();
            let fraction = parts.next()?.parse::<f32>().ok()?;
            Some(PipelineReport::Progress { phase, fraction })
        }
        "log" => {
            let level = parts.next()?.to_string();
            let message = parts.collect::<Vec<_>>().join(" ");
            Some(PipelineReport::Log { level, message })
        }
        _ => None,
    }
}

/// Runs the configured pipeline command as a guest process, one per job.
pub struct SubprocessPipeline {
    command: Vec<String>,
}

impl SubprocessPipeline {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl Pipeline for SubprocessPipeline {
    fn execute(&self, config: &JobConfig, ctx: &JobContext) -> bool {
        let Some((program, args)) = self.command.split_first() else {
            ctx.log("error", "pipeline command is empty");
            return false;
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                ctx.log("error", &format!("failed to launch pipeline {program}: {err}"));
                return false;
            }
        };
        debug!("launched pipeline guest {} for job {}", program, ctx.job_id());

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(config).unwrap_or_default();
            if let Err(err) = stdin.write_all(&payload) {
                warn!("failed to write job config to pipeline stdin: {err}");
            }
        }

        // A reader thread forwards sideband lines so the main loop can keep
        // polling the cancel flag even when the guest goes quiet.
        let (tx, rx) = mpsc::channel::<String>();
        let reader = child.stdout.take().map(|stdout| {
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
        });

        let success = loop {
            if ctx.is_canceled() {
                let _ = child.kill();
                let _ = child.wait();
                break false;
            }
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(line) => match parse_report(&line) {
                    Some(PipelineReport::Progress { phase, fraction }) => {
                        ctx.report_progress(fraction, &phase);
                    }
                    Some(PipelineReport::Log { level, message }) => {
                        ctx.log(&level, &message);
                    }
                    None => {}
                },
                Err(RecvTimeoutError::Timeout) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        break status.success();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break child.wait().map(|status| status.success()).unwrap_or(false);
                }
            }
        };

        if let Some(handle) = reader {
            let _ = handle.join();
        }
        success
    }
}
