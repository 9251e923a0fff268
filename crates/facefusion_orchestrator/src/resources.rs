//! Counting semaphores for scarce resources, accounted per job.
//!
//! GPU slots serialise the hot path (default 1); ffmpeg slots bound encoder
//! processes. Permits are held in a per-job ledger so a crashed or cancelled
//! job can be force-released with [`ResourceManager::release_all`]; normal
//! release happens when the [`ResourceGuard`] leaves scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for resource limits.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Concurrent GPU-heavy jobs.
    pub max_gpu_jobs: usize,
    /// Concurrent encoder/decoder processes.
    pub max_ffmpeg_processes: usize,
    /// Worker pool size, clamped to the host CPU count.
    pub max_cpu_workers: usize,
    /// Max wait before a job times out on the GPU.
    pub gpu_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_gpu_jobs: 1,
            max_ffmpeg_processes: 2,
            max_cpu_workers: 4,
            gpu_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Gpu,
    Ffmpeg,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Gpu => "gpu",
            ResourceKind::Ffmpeg => "ffmpeg",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised during resource acquisition.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("timed out after {timeout:?} waiting for {kind} slot for job {job_id}")]
    Timeout {
        kind: ResourceKind,
        job_id: String,
        timeout: Duration,
    },

    #[error("resource manager is closed")]
    Closed,
}

#[derive(Debug)]
struct Held {
    kind: ResourceKind,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Inner {
    limits: ResourceLimits,
    gpu: Arc<Semaphore>,
    ffmpeg: Arc<Semaphore>,
    held: Mutex<HashMap<String, Vec<Held>>>,
}

/// Bounds concurrent use of scarce resources and accounts them per job.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                gpu: Arc::new(Semaphore::new(limits.max_gpu_jobs.max(1))),
                ffmpeg: Arc::new(Semaphore::new(limits.max_ffmpeg_processes.max(1))),
                held: Mutex::new(HashMap::new()),
                limits,
            }),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }

    /// Worker pool size: the configured limit or the host CPU count,
    /// whichever is smaller.
    pub fn cpu_worker_count(&self) -> usize {
        let cpu_count = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        self.inner.limits.max_cpu_workers.min(cpu_count).max(1)
    }

    /// Acquire a GPU slot for `job_id`, waiting at most `timeout` (the
    /// configured GPU timeout when `None`).
    pub async fn acquire_gpu(
        &self,
        job_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ResourceGuard, ResourceError> {
        let timeout = timeout.unwrap_or(self.inner.limits.gpu_timeout);
        self.acquire(ResourceKind::Gpu, job_id, timeout).await
    }

    /// Acquire an ffmpeg slot for `job_id`.
    pub async fn acquire_ffmpeg(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<ResourceGuard, ResourceError> {
        self.acquire(ResourceKind::Ffmpeg, job_id, timeout).await
    }

    async fn acquire(
        &self,
        kind: ResourceKind,
        job_id: &str,
        timeout: Duration,
    ) -> Result<ResourceGuard, ResourceError> {
        let semaphore = match kind {
            ResourceKind::Gpu => Arc::clone(&self.inner.gpu),
            ResourceKind::Ffmpeg => Arc::clone(&self.inner.ffmpeg),
        };

        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| ResourceError::Timeout {
                kind,
                job_id: job_id.to_string(),
                timeout,
            })?
            .map_err(|_| ResourceError::Closed)?;

        let mut held = self.lock_held();
        held.entry(job_id.to_string()).or_default().push(Held {
            kind,
            _permit: permit,
        });

        Ok(ResourceGuard {
            manager: self.clone(),
            job_id: job_id.to_string(),
            kind,
        })
    }

    fn release(&self, job_id: &str, kind: ResourceKind) {
        let mut held = self.lock_held();
        if let Some(entries) = held.get_mut(job_id) {
            if let Some(pos) = entries.iter().position(|h| h.kind == kind) {
                entries.remove(pos);
            }
            if entries.is_empty() {
                held.remove(job_id);
            }
        }
    }

    /// Force-release every resource held by `job_id` (fatal cleanup path).
    pub fn release_all(&self, job_id: &str) {
        self.lock_held().remove(job_id);
    }

    /// Availability snapshot plus the set of jobs currently holding slots.
    pub fn status(&self) -> ResourceStatus {
        let held = self.lock_held();
        let mut active_jobs: Vec<String> = held.keys().cloned().collect();
        active_jobs.sort();
        ResourceStatus {
            gpu: SlotStatus {
                max: self.inner.limits.max_gpu_jobs,
                available: self.inner.gpu.available_permits(),
            },
            ffmpeg: SlotStatus {
                max: self.inner.limits.max_ffmpeg_processes,
                available: self.inner.ffmpeg.available_permits(),
            },
            cpu_workers: self.cpu_worker_count(),
            active_jobs,
        }
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Held>>> {
        self.inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RAII handle for one acquired slot; releases on drop.
#[derive(Debug)]
pub struct ResourceGuard {
    manager: ResourceManager,
    job_id: String,
    kind: ResourceKind,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.manager.release(&self.job_id, self.kind);
    }
}

/// Snapshot returned by [`ResourceManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub gpu: SlotStatus,
    pub ffmpeg: SlotStatus,
    pub cpu_workers: usize,
    pub active_jobs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlotStatus {
    pub max: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceManager {
        ResourceManager::new(ResourceLimits::default())
    }

    #[tokio::test]
    async fn gpu_slots_are_serialised() {
        let manager = manager();
        let guard = manager
            .acquire_gpu("job-1", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        let err = manager
            .acquire_gpu("job-2", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Timeout {
                kind: ResourceKind::Gpu,
                ..
            }
        ));

        drop(guard);
        manager
            .acquire_gpu("job-2", Some(Duration::from_millis(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn guard_drop_releases_and_updates_ledger() {
        let manager = manager();
        {
            let _gpu = manager
                .acquire_gpu("job-1", Some(Duration::from_millis(50)))
                .await
                .unwrap();
            let status = manager.status();
            assert_eq!(status.gpu.available, 0);
            assert_eq!(status.active_jobs, vec!["job-1".to_string()]);
        }
        let status = manager.status();
        assert_eq!(status.gpu.available, 1);
        assert!(status.active_jobs.is_empty());
    }

    #[tokio::test]
    async fn release_all_frees_every_slot_for_a_job() {
        let manager = manager();
        let gpu = manager
            .acquire_gpu("job-1", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let ffmpeg = manager
            .acquire_ffmpeg("job-1", Duration::from_millis(50))
            .await
            .unwrap();

        manager.release_all("job-1");
        let status = manager.status();
        assert_eq!(status.gpu.available, 1);
        assert_eq!(status.ffmpeg.available, 2);

        // Late guard drops after a force release are harmless.
        drop(gpu);
        drop(ffmpeg);
        let status = manager.status();
        assert_eq!(status.gpu.available, 1);
        assert_eq!(status.ffmpeg.available, 2);
    }

    #[tokio::test]
    async fn ffmpeg_allows_two_concurrent_holders() {
        let manager = manager();
        let _a = manager
            .acquire_ffmpeg("job-1", Duration::from_millis(50))
            .await
            .unwrap();
        let _b = manager
            .acquire_ffmpeg("job-2", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(manager
            .acquire_ffmpeg("job-3", Duration::from_millis(50))
            .await
            .is_err());
    }

    #[test]
    fn cpu_worker_count_is_clamped() {
        let manager = ResourceManager::new(ResourceLimits {
            max_cpu_workers: 1024,
            ..Default::default()
        });
        let cpu_count = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        assert_eq!(manager.cpu_worker_count(), cpu_count);

        let manager = ResourceManager::new(ResourceLimits {
            max_cpu_workers: 1,
            ..Default::default()
        });
        assert_eq!(manager.cpu_worker_count(), 1);
    }
}
