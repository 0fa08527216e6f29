//! Producer and operator subcommands.
//!
//! `enqueue` publishes a job the way experiment runners do, `status` shows
//! what the queue holds, and `requeue` is the recovery path for jobs stuck in
//! `.working` after a malformed payload, a launch failure or a dispatcher that
//! went away mid-run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use flagq_core::flag::{self, QueueSurvey};
use flagq_core::{JobSpec, JobState};

/// Queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum QueueAction {
    /// Publish a job as `<stem>.ready`.
    Enqueue {
        /// Experiment id (`--exp-id` for the analyzer)
        #[arg(long)]
        id: String,

        /// Experiment name
        #[arg(long)]
        name: String,

        /// Analysis kind (`--type` for the analyzer)
        #[arg(long)]
        kind: String,

        /// Flag file stem (default: `exp_<id>`)
        #[arg(long)]
        stem: Option<String>,
    },

    /// Show flag counts by state and list jobs in `.working`.
    Status {
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
    },

    /// Move a stuck `<stem>.working` flag back to `.ready`.
    ///
    /// A `.working` flag may belong to a worker that is still running. Only
    /// requeue once the daemon is stopped or the worker is known to be gone,
    /// otherwise the job runs twice.
    Requeue {
        /// Flag file stem
        stem: String,

        /// Confirm that no worker is still running this job
        #[arg(long)]
        force: bool,
    },
}

/// Execute a queue subcommand against `queue_dir`.
pub fn run(queue_dir: &Path, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Enqueue {
            id,
            name,
            kind,
            stem,
        } => {
            let path = enqueue(queue_dir, &id, &name, &kind, stem.as_deref())?;
            print_line(&path.display().to_string());
        }
        QueueAction::Status { json } => {
            let report = StatusReport::collect(queue_dir)?;
            let out = if json {
                serde_json::to_string_pretty(&report).context("Failed to serialize status")?
            } else {
                report.render()
            };
            print_line(out.trim_end());
        }
        QueueAction::Requeue { stem, force } => {
            let path = requeue(queue_dir, &stem, force)?;
            print_line(&path.display().to_string());
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_line(s: &str) {
    println!("{s}");
}

/// Publish a job and return the new `.ready` path.
pub fn enqueue(
    queue_dir: &Path,
    id: &str,
    name: &str,
    kind: &str,
    stem: Option<&str>,
) -> Result<PathBuf> {
    let spec = JobSpec::new(id, name, kind).context("Invalid job")?;
    let stem = stem.map_or_else(|| format!("exp_{id}"), ToString::to_string);
    let path = flag::enqueue(queue_dir, &stem, &spec)
        .with_context(|| format!("Failed to enqueue job {id}"))?;
    info!(job_id = %id, flag = %path.display(), "Job enqueued");
    Ok(path)
}

/// Put `<stem>.working` back to `.ready`.
///
/// Refuses unless `force` is set, since the flag cannot tell a stuck job from
/// one whose worker is still running.
pub fn requeue(queue_dir: &Path, stem: &str, force: bool) -> Result<PathBuf> {
    let working = queue_dir.join(format!("{stem}.{}", JobState::Working.extension()));
    if !working.exists() {
        bail!("No stuck job named {stem}: {} does not exist", working.display());
    }
    if !force {
        bail!(
            "{} may still have a running worker; stop flagq-daemon or confirm the worker \
             has exited, then rerun with --force",
            working.display()
        );
    }
    let path = flag::requeue(&working).with_context(|| format!("Failed to requeue {stem}"))?;
    info!(flag = %path.display(), "Job requeued");
    Ok(path)
}

/// Flag counts plus the in-flight jobs.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub queue_dir: PathBuf,
    pub ready: usize,
    pub working: usize,
    pub done: usize,
    pub failed: usize,
    /// `.working` stems; either running or stuck.
    pub in_flight: Vec<String>,
}

impl StatusReport {
    pub fn collect(queue_dir: &Path) -> Result<Self> {
        let survey = flag::survey(queue_dir)
            .with_context(|| format!("Failed to read queue directory {}", queue_dir.display()))?;
        Ok(Self::from_survey(queue_dir, &survey))
    }

    fn from_survey(queue_dir: &Path, survey: &QueueSurvey) -> Self {
        Self {
            queue_dir: queue_dir.to_path_buf(),
            ready: survey.ready.len(),
            working: survey.working.len(),
            done: survey.done.len(),
            failed: survey.failed.len(),
            in_flight: survey
                .in_state(JobState::Working)
                .iter()
                .filter_map(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// Human-readable report.
    pub fn render(&self) -> String {
        let total = self.ready + self.working + self.done + self.failed;
        let mut out = format!("Queue: {} ({total} flags)\n", self.queue_dir.display());
        for (state, count) in [
            (JobState::Ready, self.ready),
            (JobState::Working, self.working),
            (JobState::Done, self.done),
            (JobState::Failed, self.failed),
        ] {
            let _ = writeln!(out, "  {:<8} {count}", state.extension());
        }
        if !self.in_flight.is_empty() {
            out.push_str("In .working (running, or stuck and needing `flagq requeue --force`):\n");
            for stem in &self.in_flight {
                let _ = writeln!(out, "  {stem}");
            }
        }
        out
    }
}
