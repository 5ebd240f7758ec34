//! Error types for Betamax

use std::io;
use thiserror::Error;

/// Result type for Betamax operations
pub type Result<T> = std::result::Result<T, BetamaxError>;

/// Errors that can occur in Betamax
#[derive(Debug, Error)]
pub enum BetamaxError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cassette file exists but could not be decoded
    #[error("Invalid cassette {path}: {reason}")]
    InvalidCassette {
        /// Cassette file path
        path: String,
        /// Decoder message
        reason: String,
    },

    /// Cassette name cannot be mapped to a file
    #[error("Invalid cassette name: {0}")]
    InvalidCassetteName(String),

    /// Operation needs an inserted cassette
    #[error("Cassette is not inserted")]
    NoCassette,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Upstream could not be reached or answered garbage
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Malformed inbound request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}
