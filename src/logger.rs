use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Where and how verbosely the runtime logs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `"info"` or `"rivulet=debug"`.
    pub log_level: String,
    /// When set, a daily-rolling log file is written here in addition to
    /// stderr.
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns the appender guard when file logging is enabled; dropping it
/// flushes and stops the background writer, so hold it for the process
/// lifetime. Calling this twice fails (the subscriber is global).
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "rivulet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.json {
                Registry::default()
                    .with(env_filter)
                    .with(stderr_layer)
                    .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                    .try_init()
                    .context("tracing subscriber already installed")?;
            } else {
                Registry::default()
                    .with(env_filter)
                    .with(stderr_layer)
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .try_init()
                    .context("tracing subscriber already installed")?;
            }
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .context("tracing subscriber already installed")?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_invalid_filter_is_an_error() {
        let config = LogConfig {
            log_level: "not a [filter".to_string(),
            ..LogConfig::default()
        };
        assert!(init_tracing(&config).is_err());
    }
}
