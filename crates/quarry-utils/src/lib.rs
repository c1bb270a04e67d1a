//! # Quarry Utilities
//!
//! Shared helpers for programs built on Quarry, chiefly the `tracing`
//! subscriber setup that routes the core crate's diagnostics.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    dated_log_path, init_logging, init_logging_to_dated_file, init_logging_to_file, init_logging_with_level, LogFormat,
    LogLevel, LoggingError,
};
pub use tracing::{debug, error, info, trace, warn};
