//! # Logging Utilities
//!
//! Logging infrastructure for memlens using `tracing`.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=memlens_core=trace`)
//! - `MEMLENS_LOG_FORMAT`: Set output format (`json` or `pretty`, default: `pretty`)
//! - `MEMLENS_LOG_FILE`: Optional path to a log file (if not set, logs only to stderr)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use memlens_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
//!     .expect("Failed to initialize logging");
//! tracing::debug!("indexing started");
//! ```
//!
//! Log output goes to stderr so that values printed by the host on stdout
//! stay machine-readable.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "MEMLENS_LOG_FORMAT";

/// Environment variable naming an optional log file.
pub const LOG_FILE_ENV: &str = "MEMLENS_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    Pretty,
    /// JSON format, one event per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "text" => Ok(LogFormat::Pretty),
            "json" | "prod" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

impl LogLevel
{
    /// Map a `-v` repetition count onto a level, starting from `Warn`.
    #[must_use]
    pub fn from_verbosity(count: u8) -> Self
    {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize logging from the environment.
///
/// `RUST_LOG` wins over the default `warn` level; `MEMLENS_LOG_FORMAT` picks the
/// format and `MEMLENS_LOG_FILE` adds a file sink next to stderr.
///
/// ## Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|s| LogFormat::from_str(&s).ok())
        .unwrap_or(LogFormat::Pretty);

    init_logging_internal(format, None)
}

/// Initialize logging with an explicit level and format.
///
/// The explicit level takes precedence over `RUST_LOG`.
///
/// ## Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    init_logging_internal(format, Some(level.into()))
}

fn build_filter(explicit_level: Option<Level>) -> EnvFilter
{
    // Priority: explicit level, then RUST_LOG, then WARN
    if let Some(level) = explicit_level {
        EnvFilter::new(level.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()))
    }
}

fn file_writer(path: &Path) -> tracing_appender::non_blocking::NonBlocking
{
    let directory = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file_name = path.file_name().unwrap_or_default();
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // The worker flushes on drop; keep it for the life of the process.
    std::mem::forget(guard);
    writer
}

fn init_logging_internal(format: LogFormat, explicit_level: Option<Level>) -> Result<(), LoggingError>
{
    let log_file = env::var(LOG_FILE_ENV).ok().map(PathBuf::from);

    match format {
        LogFormat::Pretty => {
            let console_layer = fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(true)
                .with_writer(io::stderr)
                .with_filter(build_filter(explicit_level));

            if let Some(path) = log_file {
                let file_layer = fmt::layer()
                    .with_writer(file_writer(&path))
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_filter(build_filter(explicit_level));

                Registry::default()
                    .with(console_layer)
                    .with(file_layer)
                    .try_init()
                    .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
            } else {
                Registry::default()
                    .with(console_layer)
                    .try_init()
                    .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
            }
        }
        LogFormat::Json => {
            let console_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stderr)
                .with_filter(build_filter(explicit_level));

            if let Some(path) = log_file {
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(file_writer(&path))
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_filter(build_filter(explicit_level));

                Registry::default()
                    .with(console_layer)
                    .with(file_layer)
                    .try_init()
                    .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
            } else {
                Registry::default()
                    .with(console_layer)
                    .try_init()
                    .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
            }
        }
    }

    Ok(())
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// A global subscriber was already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
