//! Queue directory watcher.
//!
//! Wraps a `notify` watcher on the queue directory (non-recursive). The
//! backend runs its own thread; it only forwards [`WatchSignal`]s over a
//! bounded channel and never touches the worker pool. If the channel fills
//! up the watcher raises an overflow flag so the dispatcher rescans the
//! directory instead of losing files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flagq_core::JobState;
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Buffer size for watcher signals.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Signal from the watcher thread to the dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// A `.ready` flag appeared.
    Ready(PathBuf),
    /// Events may have been missed; the directory should be rescanned.
    Rescan { reason: String },
}

/// Live subscription to the queue directory. Dropping it stops the backend.
pub struct QueueWatcher {
    _watcher: RecommendedWatcher,
    overflowed: Arc<AtomicBool>,
    dir: PathBuf,
}

impl QueueWatcher {
    /// Start watching `dir`. Returns the watcher and the signal receiver.
    pub fn start(dir: &Path) -> Result<(Self, mpsc::Receiver<WatchSignal>), WatchError> {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflowed);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let signals = match res {
                Ok(event) => ready_paths(&event)
                    .into_iter()
                    .map(WatchSignal::Ready)
                    .collect(),
                Err(e) => vec![WatchSignal::Rescan {
                    reason: e.to_string(),
                }],
            };
            for signal in signals {
                match tx.try_send(signal) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(_)) => overflow_flag.store(true, Ordering::Release),
                }
            }
        })
        .map_err(|source| WatchError::Backend {
            path: dir.to_path_buf(),
            source,
        })?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Backend {
                path: dir.to_path_buf(),
                source,
            })?;
        debug!(dir = %dir.display(), "Watching queue directory");

        Ok((
            Self {
                _watcher: watcher,
                overflowed,
                dir: dir.to_path_buf(),
            },
            rx,
        ))
    }

    /// Whether signals were dropped since the last call. Clears the flag.
    pub fn take_overflow(&self) -> bool {
        let overflowed = self.overflowed.swap(false, Ordering::AcqRel);
        if overflowed {
            warn!(dir = %self.dir.display(), "Watcher signal channel overflowed");
        }
        overflowed
    }
}

/// `.ready` paths that a notify event announces as newly present.
///
/// Producers publish either by writing the file in place or by renaming a
/// temporary file into place. A creation may arrive before the payload is
/// written; the dispatcher skips empty flags, and the close-after-write that
/// follows reports the file again.
pub fn ready_paths(event: &Event) -> Vec<PathBuf> {
    let candidates: Vec<&PathBuf> = match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any)
        | EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).into_iter().collect()
        }
        // Some backends cannot tell the two sides of a rename apart.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.exists()).collect()
        }
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|p| JobState::from_path(p) == Some(JobState::Ready))
        .cloned()
        .collect()
}

/// Errors from the directory watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to watch {}: {source}", path.display())]
    Backend {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
