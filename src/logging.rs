//! Process logging: a console layer plus a daily-rotated file layer.

use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// The console follows `RUST_LOG` (or `LogConfig::console_filter`), the file only
/// receives events at `LogConfig::file_level` and above. Keep the returned guard
/// alive for the lifetime of the process or buffered file lines are lost.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    let (file_layer, guard) = file_layer(config);

    let console_layer = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.console_filter.as_str().into()),
    );

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

fn file_layer<S>(config: &LogConfig) -> (impl Layer<S>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(file_level(&config.file_level));

    (layer, guard)
}

/// Parse a level name, falling back to INFO
fn file_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::INFO)
}
