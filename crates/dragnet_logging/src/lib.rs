//! Shared logging setup for Dragnet binaries.
//!
//! Two layers: a daily-rolling file under the Dragnet home directory
//! (written off-thread via tracing-appender) and stderr. Filtering
//! follows `RUST_LOG` when set.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "dragnet=info,dragnet_worker=info,dragnet_db=info";

/// Initialize tracing for a binary.
///
/// `app_name` becomes the log file stem (`<app_name>.log.<date>`);
/// `verbose` promotes the stderr layer from warnings to the full file
/// filter. The returned guard owns the background log writer: keep it
/// alive for the life of the process or buffered lines are dropped.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<WorkerGuard> {
    let log_dir = dragnet_protocol::config::logs_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{app_name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = env_filter(DEFAULT_LOG_FILTER);
    let console_filter = if verbose {
        env_filter(DEFAULT_LOG_FILTER)
    } else {
        env_filter("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(guard)
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}
