//! Error types for the apex-smoother library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.

use crate::core::key::Key;
use thiserror::Error;

/// Main result type used throughout the apex-smoother library
pub type SmootherResult<T> = Result<T, SmootherError>;

/// Main error type for the apex-smoother library
#[derive(Debug, Clone, Error)]
pub enum SmootherError {
    /// Caller contract violations, detected before any state mutation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A factor references a variable that is not registered
    #[error("Inconsistent graph: {0}")]
    InconsistentGraph(String),

    /// The local system at `key` was rank deficient or produced non-finite
    /// values during elimination
    #[error("Numerical degeneracy while eliminating variable {key}")]
    NumericalDegeneracy {
        /// The variable whose elimination failed
        key: Key,
    },

    /// A structural invariant of the elimination tree was broken; indicates
    /// an ordering or marking bug, not a user error
    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SmootherError::InvalidInput("variable x0 already present".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid input: variable x0 already present"
        );
    }

    #[test]
    fn test_degeneracy_carries_key() {
        let error = SmootherError::NumericalDegeneracy {
            key: Key::symbol('l', 3),
        };
        assert!(error.to_string().contains("l3"));
    }

    #[test]
    fn test_result_ok() {
        let result: SmootherResult<i32> = Ok(42);
        assert!(result.is_ok());
    }
}
