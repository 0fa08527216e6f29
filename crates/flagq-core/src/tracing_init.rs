//! Logging setup shared by `flagq-daemon` and the `flagq` CLI.
//!
//! `RUST_LOG` wins over the binary's default filter when it is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type OutputLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the daemon's subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is unset
///   (e.g. `"flagq_daemon=info"`).
/// * `log_json` -- one JSON object per line instead of the human-readable
///   format, for log aggregation.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let output: OutputLayer = if log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    install(output, default_filter);
}

/// Human-readable logging to stderr, keeping stdout free for command output.
pub fn init_stderr_tracing(default_filter: &str) {
    install(
        fmt::layer().with_writer(std::io::stderr).boxed(),
        default_filter,
    );
}

fn install(output: OutputLayer, default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .init();
}
