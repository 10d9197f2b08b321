//! Structured error types for the Cyanea ecosystem.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CyaneaError {
    /// Invalid input (bad arguments, malformed data)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Objects that cannot work together (alphabet or state-count mismatch)
    #[error("incompatible: {0}")]
    Incompatible(String),

    /// Index or value outside of its admissible range
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Operation that is explicitly not available for this object
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Internal consistency check failed after a structural mutation
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Lookup of a parameter that does not exist
    #[error("parameter not found: {0}")]
    ParameterNotFound(String),

    /// Parameter value outside of its constraint
    #[error("constraint violated for {name}: {value} not in {constraint}")]
    Constraint {
        name: String,
        value: f64,
        constraint: String,
    },

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;
