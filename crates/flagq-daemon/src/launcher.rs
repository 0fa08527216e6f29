//! Analyzer worker launcher.
//!
//! Turns a claimed [`JobSpec`] into a running subprocess:
//! `<program> <args...> --exp-id <id> --type <kind> --name <name>`, with
//! stdout and stderr merged into one per-job log file.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flagq_core::JobSpec;
use flagq_core::config::WorkerConfig;
use tokio::process::Command;
use tracing::info;

use crate::pool::RunningJob;

/// Spawns one analyzer process per job.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    log_dir: PathBuf,
    log_prefix: Option<String>,
}

impl Launcher {
    /// Create a launcher writing worker logs under `log_dir`.
    pub fn new(worker: &WorkerConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: worker.program.clone(),
            args: worker.args.clone(),
            env: worker.env.clone(),
            log_dir: log_dir.into(),
            log_prefix: worker.log_prefix.clone(),
        }
    }

    /// Deterministic log path: `[<prefix>_]<kind>_<name>_<id>.log`.
    pub fn log_path(&self, spec: &JobSpec) -> PathBuf {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if let Some(prefix) = &self.log_prefix {
            parts.push(sanitize(prefix));
        }
        parts.push(sanitize(&spec.kind));
        parts.push(sanitize(&spec.name));
        parts.push(sanitize(&spec.id));
        self.log_dir.join(format!("{}.log", parts.join("_")))
    }

    /// Arguments passed to the worker program, in order.
    pub fn argv(&self, spec: &JobSpec) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        for (flag, value) in [
            ("--exp-id", &spec.id),
            ("--type", &spec.kind),
            ("--name", &spec.name),
        ] {
            argv.push(flag.into());
            argv.push(value.into());
        }
        argv
    }

    /// The worker command for `spec`, without its output redirection.
    fn command(&self, spec: &JobSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(spec))
            .envs(&self.env)
            .env_remove("NOTIFY_SOCKET")
            .stdin(Stdio::null());

        // Own process group: a Ctrl+C aimed at the daemon must not reach
        // workers, which are left to finish on shutdown.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Spawn the worker for `spec`, whose claimed flag is `flag_path`.
    ///
    /// On error nothing is left running and the log handle is already
    /// closed; the flag stays `.working`.
    pub fn launch(&self, spec: &JobSpec, flag_path: &Path) -> Result<RunningJob, LaunchError> {
        let log_path = self.log_path(spec);
        let log_err = |source| LaunchError::LogFile {
            path: log_path.clone(),
            source,
        };

        fs::create_dir_all(&self.log_dir).map_err(log_err)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(log_err)?;
        let stdout = log_file.try_clone().map_err(log_err)?;
        let stderr = log_file.try_clone().map_err(log_err)?;

        let mut cmd = self.command(spec);
        cmd.stdout(stdout).stderr(stderr);

        info!(
            job_id = %spec.id,
            job_name = %spec.name,
            job_kind = %spec.kind,
            program = %self.program.display(),
            log_path = %log_path.display(),
            "Spawning analyzer worker"
        );

        let child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| LaunchError::SpawnFailed {
            program: self.program.clone(),
            reason: "worker exited before its pid could be read".to_string(),
        })?;

        Ok(RunningJob::new(
            pid,
            spec.clone(),
            flag_path.to_path_buf(),
            log_path,
            child,
            log_file,
        ))
    }
}

/// Keep log file name components free of separators and shell-hostile bytes.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Errors from launching a worker.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to open worker log {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {}: {reason}", program.display())]
    SpawnFailed { program: PathBuf, reason: String },
}
