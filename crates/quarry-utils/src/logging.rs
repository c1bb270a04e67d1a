//! # Logging Utilities
//!
//! `tracing` subscriber setup for programs embedding Quarry.
//!
//! The core crate only emits events through the `tracing` macros; whoever owns
//! the process decides where they go. This module wires up the usual choices:
//! a console layer in pretty or JSON form, optionally mirrored to a daily log
//! file, or a file-only setup for front ends that own the terminal. File-only
//! logs can be named after the current UTC date with
//! [`init_logging_to_dated_file`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_utils::init_logging;
//!
//! // Reads RUST_LOG, QUARRY_LOG_FORMAT and QUARRY_LOG_FILE
//! init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Debugger session started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=quarry_core::stack=trace`)
//! - `QUARRY_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `QUARRY_LOG_FILE`: Optional path to a log file mirrored alongside the console

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "QUARRY_LOG_FORMAT";

/// Environment variable naming an optional log file.
pub const LOG_FILE_ENV: &str = "QUARRY_LOG_FILE";

/// Keeps the non-blocking file writer alive for the lifetime of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    #[default]
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
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
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

/// Initialize logging from the environment
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Log level filter (e.g., `debug`, `quarry_core=debug`)
/// - `QUARRY_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `QUARRY_LOG_FILE`: Optional path to log file
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed, if
/// `QUARRY_LOG_FORMAT` holds an unknown value, or if the log file directory
/// cannot be created.
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };

    let default_level = env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<LogLevel>().ok())
        .map_or(Level::INFO, Into::into);

    let log_file = env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
    install(format, default_filter(default_level), true, log_file.as_deref())
}

/// Initialize console logging with an explicit level and format
///
/// `RUST_LOG` still wins when it is set, so module-specific filters keep
/// working.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    install(format, default_filter(level.into()), true, None)
}

/// Initialize file-only logging
///
/// Used by front ends that draw on stdout and cannot have log lines
/// interleaved with their output. An explicit `level` takes precedence over
/// `RUST_LOG`.
///
/// ## Errors
///
/// Returns an error if the parent directory cannot be created or a global
/// subscriber is already installed.
pub fn init_logging_to_file(path: &Path, level: Option<LogLevel>) -> Result<(), LoggingError>
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let filter = match level {
        Some(level) => EnvFilter::new(Level::from(level).to_string()),
        None => default_filter(Level::INFO),
    };
    install(LogFormat::Pretty, filter, false, Some(path))
}

/// Initialize file-only logging into a file named after today's UTC date
///
/// The file is `<directory>/<YYYY-MM-DD>-quarry.log`, so each day's sessions
/// share one file. Returns the path that was opened.
///
/// ## Errors
///
/// Same as [`init_logging_to_file`].
pub fn init_logging_to_dated_file(directory: &Path, level: Option<LogLevel>) -> Result<PathBuf, LoggingError>
{
    let path = dated_log_path(directory);
    init_logging_to_file(&path, level)?;
    Ok(path)
}

/// Path of today's log file under `directory`.
pub fn dated_log_path(directory: &Path) -> PathBuf
{
    let today = Utc::now().format("%Y-%m-%d");
    directory.join(format!("{today}-quarry.log"))
}

/// Build the filter used when no explicit level overrides `RUST_LOG`.
fn default_filter(default_level: Level) -> EnvFilter
{
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

fn install(format: LogFormat, filter: EnvFilter, console: bool, log_file: Option<&Path>) -> Result<(), LoggingError>
{
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if console {
        layers.push(format_layer(format, io::stdout, true, filter.clone()));
    }

    if let Some(path) = log_file {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().unwrap_or_default();
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if FILE_GUARD.set(guard).is_err() {
            return Err(LoggingError::InitializationFailed("a log file is already attached".into()));
        }
        layers.push(format_layer(format, writer, false, filter));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        LogFormat::Pretty => base.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// Failed to install the global subscriber
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert!(matches!(
            LogFormat::from_str("xml"),
            Err(LoggingError::InvalidFormat(value)) if value == "xml"
        ));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_dated_log_path_uses_utc_date()
    {
        let before = Utc::now().date_naive();
        let path = dated_log_path(Path::new("/var/log/quarry"));
        let after = Utc::now().date_naive();

        assert_eq!(path.parent(), Some(Path::new("/var/log/quarry")));
        let name = path.file_name().and_then(|name| name.to_str()).unwrap();
        let date = name.strip_suffix("-quarry.log").unwrap();
        let parsed = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        assert!(parsed == before || parsed == after);
    }

    #[test]
    fn test_second_initialization_is_reported()
    {
        // Whichever call wins the race to install the subscriber, the other
        // must fail instead of panicking.
        let first = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty);
        let second = init_logging_with_level(LogLevel::Debug, LogFormat::Json);
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(LoggingError::InitializationFailed(_))));
    }
}
