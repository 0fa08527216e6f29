//! Worker reaper.
//!
//! Polls every running worker without blocking. A finished worker is retired
//! from the pool (closing its log file) and its flag moves to `.done` or
//! `.fail`. This is the only place pool slots are given back.

use std::path::PathBuf;
use std::time::Duration;

use flagq_core::{JobSpec, JobState, flag};
use tracing::{error, info, warn};

use crate::pool::WorkerPool;

/// A job that left the pool during a reap pass.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub pid: u32,
    pub spec: JobSpec,
    /// `Done` or `Failed`.
    pub state: JobState,
    /// `None` when the worker was killed by a signal or could not be polled.
    pub exit_code: Option<i32>,
    /// Where the flag ended up, or `None` if the rename failed.
    pub flag_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Check every running worker once and retire the finished ones.
pub fn reap(pool: &mut WorkerPool) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();

    for pid in pool.pids() {
        let Some(job) = pool.get_mut(pid) else {
            continue;
        };
        let exit_code = match job.try_exit() {
            Ok(None) => continue,
            Ok(Some(status)) => status.code(),
            Err(e) => {
                error!(pid, job_id = %job.spec().id, error = %e, "Failed to poll worker, treating as failed");
                None
            }
        };

        let Some(job) = pool.retire(pid) else {
            continue;
        };
        let spec = job.spec().clone();
        let working_path = job.flag_path().to_path_buf();
        let elapsed = job.elapsed();
        // Closes the worker's log file.
        drop(job);

        let success = exit_code == Some(0);
        let state = if success {
            JobState::Done
        } else {
            JobState::Failed
        };

        let flag_path = match flag::finalize(&working_path, success) {
            Ok(path) => {
                if success {
                    info!(
                        pid,
                        job_id = %spec.id,
                        flag = %path.display(),
                        elapsed_secs = elapsed.as_secs(),
                        "Analyzer completed"
                    );
                } else {
                    warn!(
                        pid,
                        job_id = %spec.id,
                        exit_code = ?exit_code,
                        flag = %path.display(),
                        elapsed_secs = elapsed.as_secs(),
                        "Analyzer failed"
                    );
                }
                Some(path)
            }
            Err(e) => {
                error!(
                    pid,
                    job_id = %spec.id,
                    state = %state,
                    error = %e,
                    "Failed to finalize flag; releasing slot anyway"
                );
                None
            }
        };

        outcomes.push(JobOutcome {
            pid,
            spec,
            state,
            exit_code,
            flag_path,
            elapsed,
        });
    }

    if !pool.is_empty() {
        info!(running = pool.active_count(), capacity = pool.capacity(), "Running analyzers");
    }
    outcomes
}
