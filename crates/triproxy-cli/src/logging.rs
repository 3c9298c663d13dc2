//! Process-wide tracing subscriber setup
//!
//! Takes a plain `LoggingConfig`, not the YAML `ProxyConfig` directly —
//! `triproxy-core` has no knowledge of how this crate chooses to format
//! or route its own log output.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use triproxy_core::LogLevel;

pub struct LoggingConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

/// Returned to the caller so the non-blocking file writer's background
/// thread stays alive for the life of the process; dropping it silently
/// stops log delivery.
#[must_use]
pub struct LoggingGuard(#[allow(dead_code)] Option<WorkerGuard>);

fn filter_for(level: LogLevel) -> EnvFilter {
    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        // tracing has no level below ERROR; CRITICAL filters the same as
        // ERROR and is distinguished only by the operator reading the
        // configured log_level back via `validate`/`start`'s banner.
        LogLevel::Error | LogLevel::Critical => "error",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Initialize the global `tracing` subscriber. Safe to call once per
/// process; a second call is a programmer error (the underlying
/// `try_init` simply returns an error, which this propagates).
pub fn init(config: LoggingConfig) -> Result<LoggingGuard> {
    let filter = filter_for(config.level);

    match config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create log directory {}", parent.display())
                    })?;
                }
            }
            let file_name = path
                .file_name()
                .context("log_file must name a file, not a directory")?
                .to_owned();
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            let appender = rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .try_init()
                .context("failed to initialize tracing subscriber")?;

            Ok(LoggingGuard(Some(guard)))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_target(false))
                .try_init()
                .context("failed to initialize tracing subscriber")?;

            Ok(LoggingGuard(None))
        }
    }
}
