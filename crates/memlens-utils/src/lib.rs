//! # memlens utilities
//!
//! Shared helpers for the memlens workspace, mainly logging setup built on
//! `tracing`.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
