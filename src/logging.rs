//! Tracing setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "offline_sync=info";

/// Log to a daily rolling file under `{data_dir}/logs`, and to stderr when
/// `verbose` is set.
///
/// `RUST_LOG` overrides the default filter. Keep the returned guard alive
/// for the life of the process so buffered lines are flushed.
pub fn init(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  let logs_dir = data_dir.join("logs");
  std::fs::create_dir_all(&logs_dir)
    .map_err(|e| eyre!("Failed to create logs directory {}: {}", logs_dir.display(), e))?;

  let appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "offline-sync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let stderr = verbose.then(|| {
    fmt::layer()
      .with_target(true)
      .with_writer(std::io::stderr)
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(file_writer),
    )
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

  Ok(guard)
}
