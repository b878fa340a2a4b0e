//! Tracing setup shared by Tango binaries.
//!
//! A human-readable stderr layer is always installed; a JSON file layer is
//! added when a log directory is given.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Map `-v` counts and `--quiet` onto a filter directive.
pub fn filter_for(verbosity: u8, quiet: bool, base: &str) -> String {
    match verbosity {
        0 if quiet => "error".to_string(),
        0 => base.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the JSON file writer on drop and must be held
/// for the lifetime of the program.
pub fn init_tracing(
    verbosity: u8,
    quiet: bool,
    base_level: &str,
    json_dir: Option<&Path>,
) -> Option<WorkerGuard> {
    let filter = filter_for(verbosity, quiet, base_level);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match json_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let file_appender = tracing_appender::rolling::daily(dir, "tango.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init();

    guard
}
