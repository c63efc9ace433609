//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `logging.level`. With `logging.file` set, output goes
/// to a daily rolling file; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?;

  if !config.file {
    tracing_subscriber::registry()
      .with(env_filter)
      .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
    return Ok(None);
  }

  let directory = log_directory(config)?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
  let appender = tracing_appender::rolling::daily(&directory, "bizdash.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
  Ok(Some(guard))
}

fn log_directory(config: &LoggingConfig) -> Result<PathBuf> {
  if let Some(directory) = &config.directory {
    return Ok(directory.clone());
  }
  let data_dir =
    dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory for logs"))?;
  Ok(data_dir.join("bizdash").join("logs"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn explicit_directory_wins() {
    let config = LoggingConfig {
      directory: Some(PathBuf::from("/tmp/bizdash-logs")),
      ..LoggingConfig::default()
    };
    assert_eq!(log_directory(&config).unwrap(), PathBuf::from("/tmp/bizdash-logs"));
  }
}
