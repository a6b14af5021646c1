//! Structured error types for the Strata ecosystem.

use thiserror::Error;

/// Unified error type for all Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Out-of-range or inconsistent configuration; fatal for the run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A partition or sequence with nothing to fit.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Repeated numerical degeneracy aborted an iterative fit.
    #[error("diverged: {0}")]
    Diverged(String),

    /// The run was cancelled between iterations.
    #[error("cancelled")]
    Cancelled,

    /// The run exceeded its wall-clock budget.
    #[error("timed out")]
    TimedOut,

    /// A block was handed fewer observations than its span requires.
    #[error("block size mismatch: {0}")]
    BlockSizeMismatch(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Strata ecosystem.
pub type Result<T> = std::result::Result<T, StrataError>;
