//! flagq CLI library
//!
//! Queue subcommands used by the `flagq` binary.

pub mod queue_cmd;
