//! Job model: lifecycle states and the flag payload line.
//!
//! A flag file carries a single line `"<job_id>,<job_name>,<job_kind>\n"`.
//! Its extension is the job's state; [`JobState`] is the in-memory mirror of
//! that extension.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Number of comma-separated fields in a payload line.
const PAYLOAD_FIELDS: usize = 3;

/// Lifecycle state of a job, encoded on disk as the flag file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Written by a producer, waiting to be claimed.
    Ready,
    /// Claimed by a dispatcher; a worker is running (or the job is stuck).
    Working,
    /// Worker exited with status 0.
    Done,
    /// Worker exited with a non-zero status or was killed by a signal.
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Ready, Self::Working, Self::Done, Self::Failed];

    /// File extension (without the dot) for this state.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Done => "done",
            Self::Failed => "fail",
        }
    }

    /// Map a file extension back to a state.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.extension() == ext)
    }

    /// State encoded by a flag path, or `None` for non-flag files.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// The same flag path with this state's extension.
    pub fn apply_to(self, path: &Path) -> PathBuf {
        path.with_extension(self.extension())
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// The three payload fields of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSpec {
    /// Opaque identifier (experiment id).
    pub id: String,
    /// Human-readable name (experiment name).
    pub name: String,
    /// Category (experiment type, e.g. `to_present`).
    pub kind: String,
}

impl JobSpec {
    /// Build a spec, rejecting fields that cannot round-trip through a
    /// payload line.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<Self, PayloadError> {
        let spec = Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
        };
        for (index, field) in spec.fields().into_iter().enumerate() {
            if field.trim().is_empty() {
                return Err(PayloadError::EmptyField { index });
            }
            if field.contains([',', '\n', '\r']) || field.trim() != field {
                return Err(PayloadError::InvalidField {
                    index,
                    value: field.to_string(),
                });
            }
        }
        Ok(spec)
    }

    /// Parse a payload line. Surrounding whitespace is trimmed from the line
    /// and from each field; exactly three non-empty fields are required.
    pub fn parse(line: &str) -> Result<Self, PayloadError> {
        let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if parts.len() != PAYLOAD_FIELDS {
            return Err(PayloadError::FieldCount { found: parts.len() });
        }
        if let Some(index) = parts.iter().position(|p| p.is_empty()) {
            return Err(PayloadError::EmptyField { index });
        }
        Ok(Self {
            id: parts[0].to_string(),
            name: parts[1].to_string(),
            kind: parts[2].to_string(),
        })
    }

    /// Render the payload line, newline included.
    pub fn to_line(&self) -> String {
        format!("{},{},{}\n", self.id, self.name, self.kind)
    }

    const fn fields(&self) -> [&String; PAYLOAD_FIELDS] {
        [&self.id, &self.name, &self.kind]
    }
}

/// Errors from payload parsing or validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("expected {PAYLOAD_FIELDS} comma-separated fields, found {found}")]
    FieldCount { found: usize },

    #[error("field {index} is empty")]
    EmptyField { index: usize },

    #[error("field {index} contains a comma, newline or padding: {value:?}")]
    InvalidField { index: usize, value: String },
}
