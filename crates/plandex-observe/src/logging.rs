//! `tracing` setup for the `plandex` binary.
//!
//! Logs go to a daily-rotated file under `<home>/.plandex/logs` and, at warn
//! level (debug with `--verbose`), to stderr. `PLANDEX_LOG` overrides the filter.

use anyhow::Result;
use plandex_core::LogConfig;
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_FILE_NAME: &str = "plandex.log";
pub const LOG_ENV_VAR: &str = "PLANDEX_LOG";

/// Keeps the non-blocking file writer alive; flushes on drop.
pub struct LoggingGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(config: &LogConfig, verbose: bool) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stderr_level = if verbose { "debug" } else { "warn" };
    fn make_stderr_layer<S>(stderr_level: &str) -> impl Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(EnvFilter::new(stderr_level))
    }

    let log_dir = config.resolved_dir().filter(|_| config.file_enabled);
    let Some(log_dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(make_stderr_layer(stderr_level))
            .try_init();
        return Ok(LoggingGuard { _guard: None });
    };

    std::fs::create_dir_all(&log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(make_stderr_layer(stderr_level))
        .try_init();

    tracing::debug!(log_dir = %log_dir.display(), level = %config.level, "logging initialized");

    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

/// Logging for tests: captured by the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env(LOG_ENV_VAR))
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

pub fn log_file_dir(config: &LogConfig) -> Option<PathBuf> {
    config.resolved_dir()
}
