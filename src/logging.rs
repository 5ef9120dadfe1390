use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Rolling file appender for the configured rotation policy
fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    }
}

/// `RUST_LOG` wins over the configured level
fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    let registry = tracing_subscriber::registry().with(env_filter(config));

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true) // Keep target in JSON for structured queries
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
