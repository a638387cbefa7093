//! Error types for the exporter

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for exporter operations
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Main error type for the exporter
///
/// Every variant is fatal at startup. Per-line conditions use [`ParseError`]
/// and never escape an ingestor.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Label schema could not be compiled
    #[error("namespace '{namespace}': {message}")]
    Schema { namespace: String, message: String },

    /// A source file could not be opened for tailing
    #[error("cannot tail '{}': {source}", path.display())]
    Tail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric creation or registration failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Service discovery backend failure
    #[error("discovery error: {0}")]
    Discovery(String),
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Metrics(err.to_string())
    }
}

/// Error for a single log line
///
/// Always recoverable: the line is logged and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line does not match the namespace format
    #[error("line does not match format '{format}'")]
    NoMatch { format: String },

    /// Field is not part of the parsed line
    #[error("field '{0}' not found")]
    MissingField(String),

    /// Field is present but not a number
    #[error("field '{field}' is not numeric: '{value}'")]
    NotNumeric { field: String, value: String },
}
