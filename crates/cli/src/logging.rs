//! Tracing setup
//!
//! Human output goes to stdout; diagnostics go to stderr, filtered by
//! `RUST_LOG` (default `info`). When `paths.log_dir` is configured, the
//! same events are also appended to a daily rolling file there.

use rampart_core::EngineConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "rampart.log";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer and must be held until exit.
pub fn init(config: &EngineConfig, verbose: bool) -> Option<WorkerGuard> {
    let default = if verbose { "debug" } else { "info" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let Some(log_dir) = &config.paths.log_dir else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        tracing_subscriber::registry().with(stderr_layer).init();
        tracing::warn!("Cannot create log directory {}: {}", log_dir.display(), e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
