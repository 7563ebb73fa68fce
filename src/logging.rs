use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target used for transaction audit records
pub const AUDIT_TARGET: &str = "audit";

/// Build the filter directive string from config
fn filter_directives(config: &AppConfig) -> String {
    if config.enable_audit_log {
        format!("{},{}=info", config.log_level, AUDIT_TARGET)
    } else {
        format!("{},{}=off", config.log_level, AUDIT_TARGET)
    }
}

/// Install the global subscriber: a rolling file writer plus, in text
/// mode, ANSI stdout.
///
/// Pipeline audit records are emitted at `info` under the
/// [`AUDIT_TARGET`] target. `enable_audit_log` adds `audit=info` to the
/// filter, or `audit=off` to silence them whatever `log_level` says.
/// `RUST_LOG` replaces the whole directive set, audit toggle included.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        // target stays visible so audit lines are distinguishable
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
