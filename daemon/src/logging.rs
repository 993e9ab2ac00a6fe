//! Structured logging setup: text or JSON, stdout or file.

use crate::config::LoggingConfig;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Returns a guard that must live for the duration of the process when file
/// output is configured; dropping it flushes buffered log lines.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = build_filter(&config.level);
    let json = config.format.eq_ignore_ascii_case("json");

    match config.file.as_deref() {
        Some(path) => {
            let (writer, guard) = file_writer(path);
            if json {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(writer)
                            .with_filter(filter),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(filter),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            if json {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(io::stderr)
                            .with_filter(filter),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(io::stderr)
                            .with_filter(filter),
                    )
                    .init();
            }
            None
        }
    }
}

/// Build the filter from the configured level; `RUST_LOG` wins when set.
fn build_filter(level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    EnvFilter::try_new(level.to_string()).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "amux-tracker.log".to_string());
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warning: could not create log directory {}: {e}", dir.display());
    }
    let appender = tracing_appender::rolling::never(dir, file_name);
    tracing_appender::non_blocking(appender)
}
