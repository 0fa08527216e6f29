//! flagq daemon
//!
//! Watches the queue directory for `.ready` flags and runs one analyzer
//! worker per job, up to the configured pool capacity.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use flagq_core::config::{self, Config, WatchMode};
use flagq_daemon::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "flagq-daemon")]
#[command(version, about = "flagq daemon - flag-file queue analyzer dispatcher")]
struct Args {
    /// JSON settings file layered over the global settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory watched for `.ready` flags
    #[arg(long, env = "FLAGQ_QUEUE_DIR")]
    queue_dir: Option<PathBuf>,

    /// Directory for per-job worker logs
    #[arg(long, env = "FLAGQ_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Maximum concurrent analyzer workers
    #[arg(long, env = "FLAGQ_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Seconds between dispatcher ticks
    #[arg(long, env = "FLAGQ_POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Discovery mode: "event" (filesystem notifications) or "poll"
    #[arg(long, env = "FLAGQ_WATCH_MODE")]
    mode: Option<WatchMode>,

    /// Analyzer program
    #[arg(long, env = "FLAGQ_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,

    /// Leading analyzer argument (repeatable), placed before the job flags
    #[arg(
        long = "worker-arg",
        env = "FLAGQ_WORKER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    worker_args: Vec<String>,

    /// Prefix for worker log file names
    #[arg(long, env = "FLAGQ_LOG_PREFIX")]
    log_prefix: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "FLAGQ_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FLAGQ_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Layer flags and environment over the file-based settings.
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.queue_dir {
            config.queue.queue_dir.clone_from(dir);
        }
        if let Some(dir) = &self.log_dir {
            config.queue.log_dir.clone_from(dir);
        }
        if let Some(n) = self.max_workers {
            config.queue.max_workers = n;
        }
        if let Some(secs) = self.poll_interval {
            config.queue.poll_interval_secs = secs;
        }
        if let Some(mode) = self.mode {
            config.queue.mode = mode;
        }
        if let Some(program) = &self.worker_program {
            config.worker.program.clone_from(program);
        }
        if !self.worker_args.is_empty() {
            config.worker.args.clone_from(&self.worker_args);
        }
        if let Some(prefix) = &self.log_prefix {
            config.worker.log_prefix = Some(prefix.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("flagq_daemon={},flagq_core={}", args.log_level, args.log_level);
    flagq_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = config::load_config(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut config);
    config.validate().context("Invalid settings")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue_dir = %config.queue.queue_dir.display(),
        mode = %config.queue.mode,
        max_workers = config.queue.max_workers,
        program = %config.worker.program.display(),
        "Starting flagq-daemon"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let dispatcher = Dispatcher::new(&config).on_ready(|| {
        #[cfg(unix)]
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!(error = %e, "Failed to notify systemd");
        }
        info!("Dispatcher ready");
    });
    let mut dispatch = tokio::spawn(dispatcher.run(shutdown_rx));

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = &mut dispatch => {
            let summary = result.context("Dispatcher task panicked")??;
            info!(%summary, "Dispatcher exited");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let summary = dispatch.await.context("Dispatcher task panicked")??;
    info!(%summary, "flagq-daemon stopped");
    Ok(())
}
