//! Configuration resolution for flagq.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/flagq/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables and CLI arguments (applied by the binaries)

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete flagq configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// How the dispatcher discovers new `.ready` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Filesystem notifications plus a startup scan.
    #[default]
    Event,
    /// Full directory listing every poll interval.
    Poll,
}

impl FromStr for WatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(Self::Event),
            "poll" => Ok(Self::Poll),
            other => Err(Error::Invalid(format!(
                "unknown watch mode {other:?} (expected \"event\" or \"poll\")"
            ))),
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => f.write_str("event"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

/// Queue and scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub queue_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_workers: usize,
    pub poll_interval_secs: u64,
    pub mode: WatchMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_dir: PathBuf::from("analyzer_queue"),
            log_dir: PathBuf::from("logs"),
            max_workers: 2,
            poll_interval_secs: 5,
            mode: WatchMode::default(),
        }
    }
}

/// The analyzer command launched for each job.
///
/// The job fields are appended as `--exp-id <id> --type <kind> --name <name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Per-spawn environment overrides.
    pub env: HashMap<String, String>,
    /// Optional log file name prefix (e.g. `ssmt` or `local`).
    pub log_prefix: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["analyzers/post_analysis.py".to_string()],
            env: HashMap::from([("NO_COLOR".to_string(), "1".to_string())]),
            log_prefix: None,
        }
    }
}

impl Config {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_workers == 0 {
            return Err(Error::Invalid("max_workers must be at least 1".into()));
        }
        if self.queue.poll_interval_secs == 0 {
            return Err(Error::Invalid("poll_interval_secs must be at least 1".into()));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(Error::Invalid("worker program must not be empty".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    load_layers(global.as_deref(), explicit)
}

/// Resolve defaults, then `global`, then `explicit`. Only keys present in a
/// file override the layer below; nested objects such as `worker.env` merge.
fn load_layers(global: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())
        .map_err(|e| Error::Invalid(format!("default settings: {e}")))?;
    for path in global.into_iter().chain(explicit) {
        merge_values(&mut merged, read_layer(path)?);
    }
    serde_json::from_value(merged).map_err(|e| Error::Invalid(e.to_string()))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".flagq").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/flagq/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("flagq").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read one settings file, rejecting values of the wrong shape up front so
/// the error names the file that carries them.
fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Config::deserialize(&value).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(value)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.queue.queue_dir, PathBuf::from("analyzer_queue"));
        assert_eq!(config.queue.log_dir, PathBuf::from("logs"));
        assert_eq!(config.queue.max_workers, 2);
        assert_eq!(config.queue.poll_interval_secs, 5);
        assert_eq!(config.worker.env.get("NO_COLOR").map(String::as_str), Some("1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"queue": {"max_workers": 3, "mode": "poll"}, "worker": {"log_prefix": "ssmt"}}"#,
        )
        .unwrap();

        let config = load_layers(None, Some(&path)).unwrap();
        assert_eq!(config.queue.max_workers, 3);
        assert_eq!(config.queue.mode, WatchMode::Poll);
        assert_eq!(config.queue.poll_interval_secs, 5);
        assert_eq!(config.worker.log_prefix.as_deref(), Some("ssmt"));
        assert_eq!(config.worker.program, PathBuf::from("python3"));
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagq.json");
        std::fs::write(
            &path,
            r#"{"worker": {"program": "/usr/bin/env", "args": ["analyze"], "env": {"MPLBACKEND": "Agg"}}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.worker.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(config.worker.args, vec!["analyze".to_string()]);
        assert_eq!(config.worker.env.get("MPLBACKEND").map(String::as_str), Some("Agg"));
        // NO_COLOR survives because env maps are merged.
        assert!(config.worker.env.contains_key("NO_COLOR"));
    }

    #[test]
    fn unreadable_file_is_read_error() {
        let err = load_config(Some(Path::new("/nonexistent/flagq.json"))).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_layers(None, Some(&path)), Err(Error::Parse { .. })));
    }

    #[test]
    fn wrong_type_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagq.json");
        std::fs::write(&path, r#"{"queue": {"max_workers": "many"}}"#).unwrap();
        match load_layers(None, Some(&path)).unwrap_err() {
            Error::Parse { path: bad, .. } => assert_eq!(bad, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn explicit_file_keeps_global_values() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("settings.json");
        std::fs::write(
            &global,
            r#"{"queue": {"max_workers": 3, "queue_dir": "/srv/analyzer_queue"}, "worker": {"env": {"MPLBACKEND": "Agg"}}}"#,
        )
        .unwrap();
        let explicit = dir.path().join("flagq.json");
        std::fs::write(&explicit, r#"{"worker": {"log_prefix": "ssmt"}}"#).unwrap();

        let config = load_layers(Some(&global), Some(&explicit)).unwrap();
        assert_eq!(config.queue.max_workers, 3);
        assert_eq!(config.queue.queue_dir, PathBuf::from("/srv/analyzer_queue"));
        assert_eq!(config.queue.poll_interval_secs, 5);
        assert_eq!(config.worker.log_prefix.as_deref(), Some("ssmt"));
        assert_eq!(config.worker.env.get("MPLBACKEND").map(String::as_str), Some("Agg"));
        assert!(config.worker.env.contains_key("NO_COLOR"));
    }

    #[test]
    fn later_layer_wins_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("settings.json");
        std::fs::write(&global, r#"{"queue": {"max_workers": 3, "mode": "poll"}}"#).unwrap();
        let explicit = dir.path().join("flagq.json");
        std::fs::write(&explicit, r#"{"queue": {"max_workers": 6}}"#).unwrap();

        let config = load_layers(Some(&global), Some(&explicit)).unwrap();
        assert_eq!(config.queue.max_workers, 6);
        assert_eq!(config.queue.mode, WatchMode::Poll);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.queue.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.queue.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn watch_mode_parses() {
        assert_eq!("event".parse::<WatchMode>().unwrap(), WatchMode::Event);
        assert_eq!("POLL".parse::<WatchMode>().unwrap(), WatchMode::Poll);
        assert!("inotify".parse::<WatchMode>().is_err());
        assert_eq!(WatchMode::Poll.to_string(), "poll");
    }
}
