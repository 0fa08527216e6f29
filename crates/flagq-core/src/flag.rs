//! Flag file protocol.
//!
//! Job state lives in the flag file's extension and every transition is a
//! `rename(2)` inside the queue directory. Because only one rename of a given
//! source can succeed, the rename from `.ready` to `.working` is the claim:
//! independent dispatchers sharing a directory never launch the same job
//! twice, and no lock file is involved.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::job::{JobSpec, JobState, PayloadError};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The rename succeeded; the job is now ours at this `.working` path.
    Claimed(PathBuf),
    /// The `.ready` file was gone: another dispatcher claimed it first.
    Lost,
}

/// Errors from flag file operations.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("{} is not a .{expected} flag", path.display())]
    UnexpectedState { path: PathBuf, expected: JobState },

    #[error("{} already exists, refusing to overwrite it", path.display())]
    Occupied { path: PathBuf },

    #[error("Malformed job payload in {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: PayloadError,
    },

    #[error("Invalid job field: {0}")]
    InvalidField(#[from] PayloadError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FlagError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn expect_state(path: &Path, expected: JobState) -> Result<(), FlagError> {
    if JobState::from_path(path) == Some(expected) {
        Ok(())
    } else {
        Err(FlagError::UnexpectedState {
            path: path.to_path_buf(),
            expected,
        })
    }
}

/// Claim a `.ready` flag by renaming it to `.working`.
///
/// A missing source means the race was lost and yields [`Claim::Lost`].
pub fn claim(ready_path: &Path) -> Result<Claim, FlagError> {
    expect_state(ready_path, JobState::Ready)?;
    let working_path = JobState::Working.apply_to(ready_path);

    // A stuck job with the same stem still owns its `.working` record. If the
    // `.ready` file is already gone the rename below reports the lost race.
    if working_path.exists() && ready_path.exists() {
        return Err(FlagError::Occupied { path: working_path });
    }

    match fs::rename(ready_path, &working_path) {
        Ok(()) => {
            debug!(from = %ready_path.display(), to = %working_path.display(), "Claimed flag");
            Ok(Claim::Claimed(working_path))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(flag = %ready_path.display(), "Flag already claimed elsewhere");
            Ok(Claim::Lost)
        }
        Err(e) => Err(FlagError::io(ready_path, e)),
    }
}

/// Read and parse the payload of a claimed flag.
pub fn parse(working_path: &Path) -> Result<JobSpec, FlagError> {
    let content = fs::read_to_string(working_path).map_err(|e| FlagError::io(working_path, e))?;
    JobSpec::parse(&content).map_err(|source| FlagError::Malformed {
        path: working_path.to_path_buf(),
        source,
    })
}

/// Move a `.working` flag to its terminal state.
///
/// Returns the new path (`.done` on success, `.fail` otherwise).
pub fn finalize(working_path: &Path, success: bool) -> Result<PathBuf, FlagError> {
    expect_state(working_path, JobState::Working)?;
    let state = if success {
        JobState::Done
    } else {
        JobState::Failed
    };
    let terminal_path = state.apply_to(working_path);
    fs::rename(working_path, &terminal_path).map_err(|e| FlagError::io(working_path, e))?;
    Ok(terminal_path)
}

/// Publish a new job as `<stem>.ready` in `queue_dir`.
///
/// The payload is written to a hidden temporary file first and renamed into
/// place, so a watcher never reads a half-written flag.
pub fn enqueue(queue_dir: &Path, stem: &str, spec: &JobSpec) -> Result<PathBuf, FlagError> {
    if stem.is_empty() || stem.starts_with('.') || stem.contains(['/', '\\']) {
        return Err(FlagError::InvalidField(PayloadError::InvalidField {
            index: 0,
            value: stem.to_string(),
        }));
    }
    fs::create_dir_all(queue_dir).map_err(|e| FlagError::io(queue_dir, e))?;

    let ready_path = queue_dir.join(format!("{stem}.{}", JobState::Ready.extension()));
    for state in JobState::ALL {
        let existing = state.apply_to(&ready_path);
        if existing.exists() {
            return Err(FlagError::Occupied { path: existing });
        }
    }

    let tmp_path = queue_dir.join(format!(".{stem}.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&tmp_path, spec.to_line()).map_err(|e| FlagError::io(&tmp_path, e))?;
    if let Err(e) = fs::rename(&tmp_path, &ready_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(FlagError::io(&ready_path, e));
    }
    Ok(ready_path)
}

/// Operator recovery: put a stuck `.working` flag back to `.ready`.
pub fn requeue(working_path: &Path) -> Result<PathBuf, FlagError> {
    expect_state(working_path, JobState::Working)?;
    let ready_path = JobState::Ready.apply_to(working_path);
    if ready_path.exists() {
        return Err(FlagError::Occupied { path: ready_path });
    }
    fs::rename(working_path, &ready_path).map_err(|e| FlagError::io(working_path, e))?;
    Ok(ready_path)
}

/// List the `.ready` flags currently in `queue_dir`, sorted by name.
pub fn list_ready(queue_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut ready = Vec::new();
    for entry in fs::read_dir(queue_dir)? {
        let entry = entry?;
        let path = entry.path();
        if JobState::from_path(&path) == Some(JobState::Ready) && entry.file_type()?.is_file() {
            ready.push(path);
        }
    }
    ready.sort();
    Ok(ready)
}

/// Snapshot of the queue directory grouped by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSurvey {
    pub ready: Vec<PathBuf>,
    pub working: Vec<PathBuf>,
    pub done: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl QueueSurvey {
    /// Flags in the given state.
    pub fn in_state(&self, state: JobState) -> &[PathBuf] {
        match state {
            JobState::Ready => &self.ready,
            JobState::Working => &self.working,
            JobState::Done => &self.done,
            JobState::Failed => &self.failed,
        }
    }

    /// Total number of flag files.
    pub fn total(&self) -> usize {
        self.ready.len() + self.working.len() + self.done.len() + self.failed.len()
    }
}

/// Group every flag file in `queue_dir` by state. Other files are ignored.
pub fn survey(queue_dir: &Path) -> io::Result<QueueSurvey> {
    let mut survey = QueueSurvey::default();
    for entry in fs::read_dir(queue_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let bucket = match JobState::from_path(&path) {
            Some(JobState::Ready) => &mut survey.ready,
            Some(JobState::Working) => &mut survey.working,
            Some(JobState::Done) => &mut survey.done,
            Some(JobState::Failed) => &mut survey.failed,
            None => continue,
        };
        bucket.push(path);
    }
    survey.ready.sort();
    survey.working.sort();
    survey.done.sort();
    survey.failed.sort();
    Ok(survey)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    fn write_flag(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn claim_renames_ready_to_working() {
        let dir = tempfile::tempdir().unwrap();
        let ready = write_flag(dir.path(), "job1.ready", "abc123,ExampleExp,to_present\n");

        let claim = claim(&ready).unwrap();
        assert_eq!(claim, Claim::Claimed(dir.path().join("job1.working")));
        assert!(!ready.exists());
        assert!(dir.path().join("job1.working").exists());
    }

    #[test]
    fn claim_of_missing_file_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("gone.ready");
        assert_eq!(claim(&ready).unwrap(), Claim::Lost);
    }

    #[test]
    fn second_claim_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let ready = write_flag(dir.path(), "job1.ready", "a,b,c\n");
        assert!(matches!(claim(&ready).unwrap(), Claim::Claimed(_)));
        assert_eq!(claim(&ready).unwrap(), Claim::Lost);
    }

    #[test]
    fn racing_claimants_exactly_one_wins() {
        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let ready = write_flag(dir.path(), &format!("race{round}.ready"), "a,b,c\n");
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let ready = ready.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        claim(&ready)
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| matches!(r, Ok(Claim::Claimed(_))))
                .count();
            assert_eq!(wins, 1, "round {round}");
            assert!(dir.path().join(format!("race{round}.working")).exists());
        }
    }

    #[test]
    fn claim_refuses_non_ready_path() {
        let dir = tempfile::tempdir().unwrap();
        let done = write_flag(dir.path(), "job1.done", "a,b,c\n");
        assert!(matches!(
            claim(&done),
            Err(FlagError::UnexpectedState { .. })
        ));
        assert!(done.exists());
    }

    #[test]
    fn claim_refuses_to_clobber_stuck_job() {
        let dir = tempfile::tempdir().unwrap();
        let ready = write_flag(dir.path(), "job1.ready", "new,b,c\n");
        let stuck = write_flag(dir.path(), "job1.working", "old,,\n");

        assert!(matches!(claim(&ready), Err(FlagError::Occupied { .. })));
        assert!(ready.exists());
        assert_eq!(fs::read_to_string(stuck).unwrap(), "old,,\n");
    }

    #[test]
    fn parse_reads_payload() {
        let dir = tempfile::tempdir().unwrap();
        let working = write_flag(dir.path(), "job1.working", "abc123,ExampleExp,to_present\n");
        let spec = parse(&working).unwrap();
        assert_eq!(spec.id, "abc123");
    }

    #[test]
    fn parse_reports_malformed_and_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let working = write_flag(dir.path(), "job1.working", "only,two\n");
        let err = parse(&working).unwrap_err();
        assert!(matches!(
            err,
            FlagError::Malformed {
                source: PayloadError::FieldCount { found: 2 },
                ..
            }
        ));
        assert!(working.exists());
    }

    #[test]
    fn finalize_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_flag(dir.path(), "ok.working", "a,b,c\n");
        let bad = write_flag(dir.path(), "bad.working", "a,b,c\n");

        assert_eq!(finalize(&ok, true).unwrap(), dir.path().join("ok.done"));
        assert_eq!(finalize(&bad, false).unwrap(), dir.path().join("bad.fail"));
        assert!(dir.path().join("ok.done").exists());
        assert!(dir.path().join("bad.fail").exists());
    }

    #[test]
    fn finalize_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = finalize(&dir.path().join("vanished.working"), true).unwrap_err();
        assert!(matches!(err, FlagError::Io { .. }));
    }

    #[test]
    fn enqueue_writes_ready_flag_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new("abc123", "ExampleExp", "to_present").unwrap();

        let path = enqueue(dir.path(), "exp_abc123", &spec).unwrap();
        assert_eq!(path, dir.path().join("exp_abc123.ready"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "abc123,ExampleExp,to_present\n"
        );

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temporary file left behind: {leftovers:?}");
    }

    #[test]
    fn enqueue_creates_queue_dir() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("analyzer_queue");
        let spec = JobSpec::new("1", "n", "k").unwrap();
        enqueue(&queue, "exp_1", &spec).unwrap();
        assert!(queue.join("exp_1.ready").exists());
    }

    #[test]
    fn enqueue_refuses_existing_job() {
        let dir = tempfile::tempdir().unwrap();
        write_flag(dir.path(), "exp_1.done", "1,n,k\n");
        let spec = JobSpec::new("1", "n", "k").unwrap();
        assert!(matches!(
            enqueue(dir.path(), "exp_1", &spec),
            Err(FlagError::Occupied { .. })
        ));
    }

    #[test]
    fn enqueue_rejects_bad_stem() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new("1", "n", "k").unwrap();
        assert!(enqueue(dir.path(), "../escape", &spec).is_err());
        assert!(enqueue(dir.path(), ".hidden", &spec).is_err());
    }

    #[test]
    fn requeue_moves_working_back() {
        let dir = tempfile::tempdir().unwrap();
        let working = write_flag(dir.path(), "job1.working", "a,b,c\n");
        let ready = requeue(&working).unwrap();
        assert_eq!(ready, dir.path().join("job1.ready"));
        assert!(ready.exists());
        assert!(!working.exists());
    }

    #[test]
    fn requeue_refuses_terminal_flags() {
        let dir = tempfile::tempdir().unwrap();
        let failed = write_flag(dir.path(), "job1.fail", "a,b,c\n");
        assert!(matches!(
            requeue(&failed),
            Err(FlagError::UnexpectedState { .. })
        ));
    }

    #[test]
    fn list_ready_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_flag(dir.path(), "b.ready", "a,b,c\n");
        write_flag(dir.path(), "a.ready", "a,b,c\n");
        write_flag(dir.path(), "c.done", "a,b,c\n");
        write_flag(dir.path(), "notes.txt", "hi");
        fs::create_dir(dir.path().join("dir.ready")).unwrap();

        let ready = list_ready(dir.path()).unwrap();
        assert_eq!(ready, vec![dir.path().join("a.ready"), dir.path().join("b.ready")]);
    }

    #[test]
    fn survey_groups_by_state() {
        let dir = tempfile::tempdir().unwrap();
        write_flag(dir.path(), "a.ready", "");
        write_flag(dir.path(), "b.working", "");
        write_flag(dir.path(), "c.working", "");
        write_flag(dir.path(), "d.done", "");
        write_flag(dir.path(), "e.fail", "");
        write_flag(dir.path(), "f.log", "");

        let survey = survey(dir.path()).unwrap();
        assert_eq!(survey.in_state(JobState::Ready).len(), 1);
        assert_eq!(survey.in_state(JobState::Working).len(), 2);
        assert_eq!(survey.in_state(JobState::Done).len(), 1);
        assert_eq!(survey.in_state(JobState::Failed).len(), 1);
        assert_eq!(survey.total(), 5);
    }
}
