//! Tracing setup for the kernel.
//!
//! Long-running kernels log twice: JSON lines into a daily-rotated file
//! for machines, and a readable stream on stderr for whoever is
//! watching. One-shot CLI invocations skip the file. Both modes read
//! their filter from `RUST_LOG`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for rotated log files (`turing.log.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "turing.log";

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVE: &str = "info";

/// Keeps the file writer's background worker alive.
///
/// Dropping the guard flushes buffered lines and stops the worker, so
/// hold it until shutdown. CLI mode carries no worker and the guard is
/// inert.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// `RUST_LOG` when set, the default directive otherwise.
fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the file + stderr subscriber for a long-running kernel.
///
/// JSON events land in `{logs_dir}/turing.log.YYYY-MM-DD` through a
/// non-blocking writer; stderr gets the human-readable layer.
///
/// # Errors
///
/// Fails when `logs_dir` cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating logs directory {}", logs_dir.display()))?;

    let rotation = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(rotation);

    tracing_subscriber::registry()
        .with(filter_from_env())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard {
        _file_guard: Some(file_guard),
    })
}

/// Install the stderr-only subscriber for one-shot subcommands.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(filter_from_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
