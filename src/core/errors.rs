/*!
 * Error Types
 * Centralized error handling with thiserror and miette diagnostics
 *
 * Only setup failures ever reach the caller as hard errors. Sink failures are
 * reported by output strategies and absorbed by the depository; producer-facing
 * calls never return an error at all.
 */

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Unified collector error type
#[derive(Error, Debug, Diagnostic)]
pub enum CollectorError {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(collector::configuration),
        help("Review the RACEWATCH_* settings; capacities and durations must be non-zero.")
    )]
    Configuration(String),

    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(collector::io),
        help("Check that the output directory exists and is writable.")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    #[diagnostic(code(collector::stream_io))]
    Stream(#[from] std::io::Error),

    #[error("Failed to encode event: {0}")]
    #[diagnostic(code(collector::encode))]
    Encode(String),

    #[error("Failed to decode event stream: {0}")]
    #[diagnostic(
        code(collector::decode),
        help("The stream may be truncated or written with a different format.")
    )]
    Decode(String),

    #[error("Cannot listen on port {port}: {source}")]
    #[diagnostic(
        code(collector::bind),
        help("Choose a free port for socket output.")
    )]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Shutdown failed: {0}")]
    #[diagnostic(code(collector::shutdown))]
    Shutdown(String),

    #[error("Internal error: {0}")]
    #[diagnostic(
        code(collector::internal),
        help("An unexpected internal error occurred. Please report this issue.")
    )]
    Internal(String),
}

impl CollectorError {
    /// Attach the offending path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CollectorError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            CollectorError::Stream(err.into())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            CollectorError::Decode(err.to_string())
        } else {
            CollectorError::Encode(err.to_string())
        }
    }
}

impl From<bincode::Error> for CollectorError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => CollectorError::Stream(io),
            other => CollectorError::Encode(other.to_string()),
        }
    }
}

impl From<String> for CollectorError {
    fn from(msg: String) -> Self {
        CollectorError::Internal(msg)
    }
}

impl From<&str> for CollectorError {
    fn from(msg: &str) -> Self {
        CollectorError::Internal(msg.to_string())
    }
}

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;
