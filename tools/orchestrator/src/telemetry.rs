//! Tracing setup: stderr console output plus a daily-rolling `warden.log`

use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use warden_shared::{Result, WardenError};

use crate::config::{LogFormat, WardenConfig};

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output gets flushed.
pub fn init_tracing(config: &WardenConfig) -> Result<WorkerGuard> {
    let log_dir = config.log_dir();
    fs::create_dir_all(&log_dir).map_err(|e| WardenError::io(&log_dir, e))?;

    let appender = tracing_appender::rolling::daily(&log_dir, "warden.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = match config.log_format {
        LogFormat::Text => fmt::layer().with_target(false).with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };
    let file = fmt::layer().with_ansi(false).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| WardenError::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(guard)
}
