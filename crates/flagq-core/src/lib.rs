//! `flagq` Core Library
//!
//! Shared functionality for `flagq` components:
//! - Job model and flag payload parsing
//! - Flag file protocol (claim, finalize, enqueue, survey)
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod flag;
pub mod job;
pub mod tracing_init;

pub use config::{Config, WatchMode};
pub use error::{Error, Result};
pub use flag::{Claim, FlagError};
pub use job::{JobSpec, JobState};
