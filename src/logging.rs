//! Tracing subscriber setup.
//!
//! Log lines go to stderr so command output on stdout stays clean.
//! `RUST_LOG` wins when set; otherwise the configured level applies to this
//! crate and `tower_http`. When a log directory is configured, a second
//! layer writes the same events to a daily rolling file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogFormat;

/// File name prefix for rolling log files.
const LOG_FILE_PREFIX: &str = "crewboard.log";

/// Default filter directive for a configured level.
pub fn default_directive(level: &str) -> String {
    format!("crewboard={level},tower_http={level}")
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed on exit.
pub fn init_tracing(
    format: LogFormat,
    level: &str,
    directory: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(level);

    let console_layer = match format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
