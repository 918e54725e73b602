//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured filter. With a log directory set, a
//! daily rolling file receives the same events through a non-blocking writer;
//! keep the returned guard alive or buffered lines are lost on exit.

use crate::config::LoggingConfig;
use crate::error::{MediaFlowError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter_for(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let registry = tracing_subscriber::registry()
        .with(filter_for(config))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .map_err(|e| MediaFlowError::Config(format!("Failed to init logging: {}", e)))?;
            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| MediaFlowError::Config(format!("Failed to init logging: {}", e)))?;
            Ok(None)
        }
    }
}

/// Best-effort subscriber for tests; repeated calls are harmless.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
