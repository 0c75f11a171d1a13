//! Tracing setup: stdout always, plus a non-blocking daily-rolling file when
//! a log directory is configured.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Keep this alive for the life of the process; dropping it flushes and stops
/// the background log writer.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops (tests init logging per-process).
pub fn init(config: &LogConfig) -> LogGuard {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.dir.is_empty() {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
        return LogGuard { _file: None };
    }

    let appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init();
    LogGuard { _file: Some(guard) }
}
