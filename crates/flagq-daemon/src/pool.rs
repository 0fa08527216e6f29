//! Bounded worker pool.
//!
//! The [`WorkerPool`] is the in-process running table: it maps the OS process
//! id of each analyzer worker to its [`RunningJob`]. Registration (after a
//! successful launch) and retirement (by the reaper) are the only two
//! operations that change its size, and registration refuses to exceed the
//! capacity.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use flagq_core::JobSpec;
use tokio::process::Child;
use tracing::{debug, info};

/// Default maximum number of concurrent workers.
pub const DEFAULT_CAPACITY: usize = 2;

/// A worker process owned by the pool.
///
/// Holds the child handle and the log file handle; dropping the entry closes
/// the log file. Dropping does not kill the child.
#[derive(Debug)]
pub struct RunningJob {
    pid: u32,
    spec: JobSpec,
    flag_path: PathBuf,
    log_path: PathBuf,
    child: Child,
    _log_file: File,
    started_at: Instant,
}

impl RunningJob {
    pub(crate) fn new(
        pid: u32,
        spec: JobSpec,
        flag_path: PathBuf,
        log_path: PathBuf,
        child: Child,
        log_file: File,
    ) -> Self {
        Self {
            pid,
            spec,
            flag_path,
            log_path,
            child,
            _log_file: log_file,
            started_at: Instant::now(),
        }
    }

    /// OS process id of the worker.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// The job's `.working` flag.
    pub fn flag_path(&self) -> &Path {
        &self.flag_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Non-blocking liveness check. `Ok(None)` while the worker runs.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

/// Process-wide bounded set of running workers.
#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    running: HashMap<u32, RunningJob>,
}

impl WorkerPool {
    /// Create a pool with the given capacity (0 falls back to the default).
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        info!(capacity, "WorkerPool created");
        Self {
            capacity,
            running: HashMap::new(),
        }
    }

    /// Maximum number of concurrent workers.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of workers currently running.
    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// Whether another job may be claimed right now.
    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Add a launched worker. Fails without side effects when the pool is full.
    pub fn register(&mut self, job: RunningJob) -> Result<u32, PoolError> {
        if !self.has_capacity() {
            return Err(PoolError::Exhausted {
                current: self.running.len(),
                max: self.capacity,
            });
        }
        let pid = job.pid;
        debug!(pid, job_id = %job.spec.id, "Registering worker in pool");
        self.running.insert(pid, job);
        Ok(pid)
    }

    /// Remove a worker, freeing its slot.
    pub fn retire(&mut self, pid: u32) -> Option<RunningJob> {
        debug!(pid, "Retiring worker from pool");
        self.running.remove(&pid)
    }

    /// Process ids of all running workers, sorted.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.running.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut RunningJob> {
        self.running.get_mut(&pid)
    }

    /// Iterate over running workers in no particular order.
    pub fn jobs(&self) -> impl Iterator<Item = &RunningJob> {
        self.running.values()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool exhausted ({current}/{max})")]
    Exhausted { current: usize, max: usize },
}
