//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LogFormat;

pub const LOG_FILE_NAME: &str = "deckhand.log";

#[derive(Debug, Clone, Copy)]
pub struct LogOptions<'a> {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: &'a str,
    /// Directory for the daily-rolling log file, if any.
    pub file_dir: Option<&'a Path>,
}

/// Default filter for a command: `info` for the daemon, `warn` for one-shot
/// commands, `debug` for either with `-v`.
pub fn default_filter(daemon: bool, verbose: bool) -> &'static str {
    match (verbose, daemon) {
        (true, _) => "deckhand=debug",
        (false, true) => "deckhand=info",
        (false, false) => "deckhand=warn",
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as the file sink should flush.
pub fn init(opts: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.default_filter));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    layers.push(match opts.format {
        LogFormat::Text => stderr.boxed(),
        LogFormat::Json => stderr.json().boxed(),
    });

    let guard = match opts.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_writer(writer).with_ansi(false);
            layers.push(match opts.format {
                LogFormat::Text => file.boxed(),
                LogFormat::Json => file.json().boxed(),
            });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(true, false), "deckhand=info");
        assert_eq!(default_filter(false, false), "deckhand=warn");
        assert_eq!(default_filter(false, true), "deckhand=debug");
    }
}
