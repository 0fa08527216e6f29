//! Dispatcher loop.
//!
//! Ties the queue directory, the [`WorkerPool`], the [`Launcher`] and the
//! reaper together in one cooperative task. Everything that touches the pool
//! runs sequentially inside [`Dispatcher::run`]; the notify backend only feeds
//! [`WatchSignal`]s into the loop.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flagq_core::config::{Config, WatchMode};
use flagq_core::{Claim, FlagError, JobState, flag};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::launcher::Launcher;
use crate::pool::WorkerPool;
use crate::reaper::{self, JobOutcome};
use crate::watcher::{QueueWatcher, WatchError, WatchSignal};

type ReadyHook = Box<dyn FnOnce() + Send>;

/// What happened to a single `.ready` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Claimed and running under this pid.
    Launched { pid: u32 },
    /// Another dispatcher renamed the flag first.
    RaceLost,
    /// No free slot; the flag was left untouched.
    AtCapacity,
    /// The `.ready` file is still empty; its producer has not written the
    /// payload yet. Left untouched and retried by the next scan.
    Unwritten,
    /// A `.working` flag with the same stem is still present.
    Occupied,
    /// Claimed, but the payload did not parse. Left in `.working`.
    Malformed,
    /// Claimed, but the worker could not be started. Left in `.working`.
    LaunchFailed,
    /// The claim itself failed (I/O error or not a `.ready` path).
    ClaimFailed,
}

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub launched: usize,
    pub done: usize,
    pub failed: usize,
    /// Jobs left in `.working` by a malformed payload or launch failure.
    pub stuck: usize,
    /// Workers still running when the dispatcher stopped. They are not killed.
    pub abandoned: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "launched={} done={} failed={} stuck={} abandoned={}",
            self.launched, self.done, self.failed, self.stuck, self.abandoned
        )
    }
}

/// Errors that stop the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Queue watcher stopped unexpectedly ({summary})")]
    WatcherStopped { summary: RunSummary },
}

/// Single-task dispatcher owning the running table.
pub struct Dispatcher {
    queue_dir: PathBuf,
    log_dir: PathBuf,
    mode: WatchMode,
    poll_interval: Duration,
    pool: WorkerPool,
    launcher: Launcher,
    rescan_pending: bool,
    summary: RunSummary,
    /// `.ready` flags already reported as blocked by a same-stem `.working`.
    occupied: HashSet<PathBuf>,
    on_ready: Option<ReadyHook>,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        let queue = &config.queue;
        Self {
            queue_dir: queue.queue_dir.clone(),
            log_dir: queue.log_dir.clone(),
            mode: queue.mode,
            poll_interval: Duration::from_secs(queue.poll_interval_secs.max(1)),
            pool: WorkerPool::new(queue.max_workers),
            launcher: Launcher::new(&config.worker, queue.log_dir.clone()),
            rescan_pending: false,
            summary: RunSummary::default(),
            occupied: HashSet::new(),
            on_ready: None,
        }
    }

    /// Run `hook` once discovery is live (after the watcher is attached in
    /// event mode).
    #[must_use]
    pub fn on_ready(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Create the queue and log directories if they are missing.
    pub fn prepare(&self) -> Result<(), DispatchError> {
        for dir in [&self.queue_dir, &self.log_dir] {
            fs::create_dir_all(dir).map_err(|source| DispatchError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Claim, parse, launch and register one `.ready` flag.
    pub fn dispatch(&mut self, ready_path: &Path) -> DispatchOutcome {
        if !self.pool.has_capacity() {
            return DispatchOutcome::AtCapacity;
        }

        // Direct writers create the file before writing the payload.
        if fs::metadata(ready_path).is_ok_and(|meta| meta.len() == 0) {
            debug!(flag = %ready_path.display(), "Flag has no payload yet; retrying on next scan");
            self.rescan_pending = true;
            return DispatchOutcome::Unwritten;
        }

        let working_path = match flag::claim(ready_path) {
            Ok(Claim::Claimed(path)) => {
                self.occupied.remove(ready_path);
                path
            }
            Ok(Claim::Lost) => return DispatchOutcome::RaceLost,
            Err(FlagError::Occupied { path }) => {
                if self.occupied.insert(ready_path.to_path_buf()) {
                    warn!(
                        flag = %ready_path.display(),
                        working = %path.display(),
                        "Job with the same name is still in .working; leaving flag for the operator"
                    );
                } else {
                    debug!(flag = %ready_path.display(), "Flag still blocked by .working");
                }
                return DispatchOutcome::Occupied;
            }
            Err(e) => {
                error!(flag = %ready_path.display(), error = %e, "Failed to claim flag");
                return DispatchOutcome::ClaimFailed;
            }
        };

        let spec = match flag::parse(&working_path) {
            Ok(spec) => spec,
            Err(e) => {
                error!(
                    flag = %working_path.display(),
                    error = %e,
                    "Malformed job payload; flag left in .working"
                );
                self.summary.stuck += 1;
                return DispatchOutcome::Malformed;
            }
        };

        let job = match self.launcher.launch(&spec, &working_path) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    job_id = %spec.id,
                    flag = %working_path.display(),
                    error = %e,
                    "Failed to launch analyzer; flag left in .working"
                );
                self.summary.stuck += 1;
                return DispatchOutcome::LaunchFailed;
            }
        };
        let log_path = job.log_path().to_path_buf();

        match self.pool.register(job) {
            Ok(pid) => {
                self.summary.launched += 1;
                info!(
                    pid,
                    job_id = %spec.id,
                    flag = %working_path.display(),
                    log_path = %log_path.display(),
                    running = self.pool.active_count(),
                    capacity = self.pool.capacity(),
                    "Analyzer launched"
                );
                DispatchOutcome::Launched { pid }
            }
            // Unreachable while capacity is checked above; the dropped job is
            // not killed and its flag stays `.working`.
            Err(e) => {
                error!(job_id = %spec.id, error = %e, "Failed to register analyzer");
                self.summary.stuck += 1;
                DispatchOutcome::LaunchFailed
            }
        }
    }

    /// Full directory scan, claiming flags while slots remain.
    pub fn discover(&mut self) -> Vec<DispatchOutcome> {
        self.rescan_pending = false;
        let ready = match flag::list_ready(&self.queue_dir) {
            Ok(ready) => ready,
            Err(e) => {
                error!(dir = %self.queue_dir.display(), error = %e, "Failed to scan queue directory");
                self.rescan_pending = true;
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for (index, path) in ready.iter().enumerate() {
            if !self.pool.has_capacity() {
                debug!(
                    skipped = ready.len() - index,
                    "Worker pool full; remaining flags wait for a free slot"
                );
                self.rescan_pending = true;
                break;
            }
            outcomes.push(self.dispatch(path));
        }
        outcomes
    }

    /// Dispatch a single flag announced by the watcher.
    pub fn handle_ready(&mut self, ready_path: &Path) -> DispatchOutcome {
        let outcome = self.dispatch(ready_path);
        if outcome == DispatchOutcome::AtCapacity {
            debug!(flag = %ready_path.display(), "Worker pool full; flag deferred to rescan");
            self.rescan_pending = true;
        }
        outcome
    }

    pub fn handle_signal(&mut self, signal: WatchSignal) {
        match signal {
            WatchSignal::Ready(path) => {
                self.handle_ready(&path);
            }
            WatchSignal::Rescan { reason } => {
                warn!(reason = %reason, "Watcher requested a rescan");
                self.rescan_pending = true;
            }
        }
    }

    /// Reap finished workers and fold them into the summary.
    pub fn reap(&mut self) -> Vec<JobOutcome> {
        let outcomes = reaper::reap(&mut self.pool);
        for outcome in &outcomes {
            if outcome.state == JobState::Done {
                self.summary.done += 1;
            } else {
                self.summary.failed += 1;
            }
        }
        outcomes
    }

    /// One dispatcher cycle: reap, then discover as the mode requires.
    pub fn tick(&mut self) -> Vec<JobOutcome> {
        let outcomes = self.reap();
        match self.mode {
            WatchMode::Poll => {
                self.discover();
            }
            WatchMode::Event => {
                if self.rescan_pending && self.pool.has_capacity() {
                    self.discover();
                }
            }
        }
        outcomes
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Running workers are abandoned, not killed, when the loop stops.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, DispatchError> {
        self.prepare()?;
        info!(
            queue_dir = %self.queue_dir.display(),
            log_dir = %self.log_dir.display(),
            mode = %self.mode,
            capacity = self.pool.capacity(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Dispatcher starting"
        );

        match self.mode {
            WatchMode::Poll => self.run_polling(&mut shutdown).await,
            WatchMode::Event => self.run_events(&mut shutdown).await?,
        }

        Ok(self.abandon())
    }

    async fn run_polling(&mut self, shutdown: &mut watch::Receiver<bool>) {
        self.notify_ready();
        let mut interval = self.interval();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn run_events(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let (watcher, mut signals) = QueueWatcher::start(&self.queue_dir)?;
        self.notify_ready();

        // Flags published before the watcher attached.
        self.discover();

        let result = self
            .event_loop(&mut signals, || watcher.take_overflow(), shutdown)
            .await;
        // Stops the backend thread.
        drop(watcher);
        result
    }

    /// Serve watcher signals until shutdown. A closed signal channel means
    /// the watcher died, and the loop falls through to [`Self::drain`].
    async fn event_loop(
        &mut self,
        signals: &mut mpsc::Receiver<WatchSignal>,
        overflowed: impl Fn() -> bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let mut interval = self.interval();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if overflowed() {
                        self.rescan_pending = true;
                    }
                    self.tick();
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        return self.drain(shutdown).await;
                    };
                    self.handle_signal(signal);
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        Ok(())
    }

    /// Discovery is gone: keep reaping until the pool empties or shutdown.
    async fn drain(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), DispatchError> {
        error!(
            running = self.pool.active_count(),
            "Queue watcher stopped; draining running analyzers"
        );
        let mut interval = self.interval();
        while !self.pool.is_empty() {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap();
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        Err(DispatchError::WatcherStopped {
            summary: self.abandon(),
        })
    }

    fn interval(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    fn notify_ready(&mut self) {
        if let Some(hook) = self.on_ready.take() {
            hook();
        }
    }

    /// Log workers left running and produce the final summary.
    fn abandon(&mut self) -> RunSummary {
        for job in self.pool.jobs() {
            warn!(
                pid = job.pid(),
                job_id = %job.spec().id,
                flag = %job.flag_path().display(),
                elapsed_secs = job.elapsed().as_secs(),
                "Leaving analyzer running; its flag stays in .working"
            );
        }
        self.summary.abandoned = self.pool.active_count();
        info!(summary = %self.summary, "Dispatcher stopped");
        self.summary
    }
}
