//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Production** ([`init_production`]): JSON file layer (daily rotation) + console layer
//! - **CLI** ([`init_cli`]): console-only for `status`, `audit` and `verify`
//!
//! Transcript text and vault values are never logged; events carry call ids,
//! counts, categories and token names only.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rotated JSON log; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "callsift.log";

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise logging for the `run` subcommand (production mode).
///
/// Writes JSON logs to `{logs_dir}/callsift.log.YYYY-MM-DD` with daily
/// rotation. Also emits human-readable output to stderr controlled by the
/// `RUST_LOG` environment variable (default: `info`). Per-call spans carry
/// the `call_id`, so every JSON line can be traced back to its transcript.
///
/// Returns a [`LoggingGuard`] that must be held until the run finishes so the
/// final checkpoint and audit events reach the file.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise minimal logging for `status`, `audit` and `verify`.
///
/// Emits human-readable output to stderr only. No file rotation, since these
/// commands never call the model. Controlled by `RUST_LOG` (default: `info`).
/// A subscriber installed earlier is left in place.
pub fn init_cli() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _already_installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
