//! Compute backend error types.

use thiserror::Error;

/// Result type for compute backend operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Errors that can occur while driving the compute substrate.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A substrate command failed.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// A substrate call exceeded its deadline.
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Failed to parse substrate output.
    #[error("failed to parse substrate output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
