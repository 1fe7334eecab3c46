//! Logging infrastructure for templatefs.
//!
//! Structured logging via `tracing`:
//! - stderr output by default (stdout stays clean for FUSE tooling)
//! - optional file destination via a non-blocking appender
//! - level filtering through the `RUST_LOG` environment variable
//!
//! Also provides [`log_text_block`], which emits a multi-line buffer as a
//! series of warning records with 1-based line numbers, used for captured
//! child-process stderr.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the file writer, if one was
/// configured.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system.
///
/// Logs go to stderr; when `log_file` is given, records are also appended
/// to that file without ANSI colors. The filter defaults to `info` unless
/// `RUST_LOG` overrides it.
pub fn init_logging(log_file: Option<&Path>) -> Result<LoggingGuard, io::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(true);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| OsStr::new("templatefs.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Emit a block of text as numbered warning lines, labeled with its
/// origin. Line numbers start at 1.
pub fn log_text_block(label: &str, text: &[u8]) {
    let text = String::from_utf8_lossy(text);
    for (index, line) in text.lines().enumerate() {
        tracing::warn!("{label}: {:>3}: {line}", index + 1);
    }
}
