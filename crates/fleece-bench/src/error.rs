//! Error types for benchmark sessions

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that can occur while orchestrating a benchmark session.
///
/// Only [`BenchError::Config`] and I/O failures while preparing the output
/// directory escape [`crate::Session::run`]. Every other variant is caught at
/// the cell or tick boundary and recorded as data.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Missing or invalid matrix input
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CSV encoding or decoding failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// GPU monitoring query failed or returned nothing parseable
    #[error("Telemetry query failed: {0}")]
    Telemetry(String),

    /// The inference engine could not be invoked
    #[error("Engine invocation failed: {0}")]
    Engine(String),

    /// The inference engine did not return within the configured limit
    #[error("Engine invocation timed out after {0:?}")]
    Timeout(Duration),
}

impl BenchError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::config("no models configured");
        assert_eq!(err.to_string(), "Configuration error: no models configured");

        let err = BenchError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }
}
