//! Stderr logging for the CLI.

use clap::ValueEnum;
use labelship::reporter::Reporter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter directives are read from this variable, e.g. `LABELSHIP_LOG=debug`.
pub const LOG_ENV: &str = "LABELSHIP_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global subscriber. Logs go to stderr so stdout stays parseable.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = installed {
        eprintln!("[warn] logging not initialized: {e}");
    }
}

/// Forwards pipeline progress to `tracing`.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&mut self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn warn(&mut self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn error(&mut self, msg: &str) {
        tracing::error!("{msg}");
    }
}
