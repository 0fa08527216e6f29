//! Settings errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the settings [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Why a configuration could not be loaded or used.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A value that parsed but cannot be run with.
    #[error("Invalid setting: {0}")]
    Invalid(String),
}
