//! flagq CLI
//!
//! Enqueue analyzer jobs and inspect or repair the flag-file queue. Logs go
//! to stderr so stdout stays scriptable.

use std::path::PathBuf;

use clap::Parser;

use flagq_cli::queue_cmd::{self, QueueAction};

#[derive(Parser, Debug)]
#[command(name = "flagq")]
#[command(version, about = "flag-file analyzer queue CLI", long_about = None)]
struct Cli {
    /// Queue directory
    #[arg(long, default_value = "analyzer_queue", env = "FLAGQ_QUEUE_DIR")]
    queue_dir: PathBuf,

    #[command(subcommand)]
    action: QueueAction,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    flagq_core::tracing_init::init_stderr_tracing("flagq=warn,flagq_cli=warn");
    queue_cmd::run(&cli.queue_dir, cli.action)
}
