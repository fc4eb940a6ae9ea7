//! Tracing subscriber setup for applications using this client.
//!
//! The library only emits `tracing` events; nothing is installed unless the
//! application calls [`init_telemetry`]. Output goes to:
//! - the console, human readable
//! - optionally JSON log files, rotated daily or at 10 MB
//!
//! The level defaults to `info` for both crates and is overridden by `RUST_LOG`.

use anyhow::Result;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

const DEFAULT_FILTER: &str = "settee_rs=info,settee_core=info";
const LOG_FILE: &str = "settee.log";
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 9;

fn console_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
}

/// Install the global subscriber.
///
/// With a `log_dir`, JSON logs are also written there and the returned guard
/// must be kept alive until shutdown so buffered lines get flushed.
pub fn init_telemetry(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer())
            .try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::new(
        log_dir.join(LOG_FILE),
        RollingConditionBasic::new().daily().max_size(MAX_LOG_SIZE),
        MAX_LOG_FILES,
    )?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_current_span(true)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer())
        .try_init()?;

    tracing::info!("Telemetry initialized with file logging to {:?}", log_dir);
    Ok(Some(guard))
}
