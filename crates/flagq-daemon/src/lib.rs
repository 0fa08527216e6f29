//! flagq Daemon Library
//!
//! Core functionality for the flagq daemon:
//! - Worker pool bounding concurrent analyzer subprocesses
//! - Launcher that spawns one analyzer per claimed job
//! - Reaper that polls workers and finalizes their flags
//! - Directory watcher (notify events or polling)
//! - Dispatcher loop tying them together

pub mod dispatcher;
pub mod launcher;
pub mod pool;
pub mod reaper;
pub mod watcher;

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, RunSummary};
pub use launcher::{LaunchError, Launcher};
pub use pool::{PoolError, RunningJob, WorkerPool};
pub use reaper::JobOutcome;
pub use watcher::{QueueWatcher, WatchError, WatchSignal};
