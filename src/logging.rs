//! Run-scoped JSONL logging: everything `tracing` emits lands in
//! `runs/<run>/logs/pipeline.log` through a non-blocking file appender.
//! Human-facing one-liners stay on stderr via the color helpers.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

/// Keep this alive for the duration of the run; dropping it flushes and
/// shuts down the writer thread.
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber writing JSONL into `logs_dir/pipeline.log`.
/// Returns None when a subscriber is already installed (tests, embedding).
pub fn init_run_logging(logs_dir: &Path) -> Option<LogGuard> {
    let _ = std::fs::create_dir_all(logs_dir);
    let file_appender = tracing_appender::rolling::never(logs_dir, "pipeline.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
    {
        Ok(_) => Some(LogGuard { _guard: guard }),
        Err(_) => None,
    }
}
