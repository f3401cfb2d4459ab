//! # Error Types
//!
//! Domain-specific error types for fiscal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fiscal-core errors (this file)                                        │
//! │  ├── CoreError        - State machine and domain failures              │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fiscal-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fiscal-engine errors (separate crate)                                 │
//! │  └── FiscalError      - AuthUnavailable, TransportFailure, ...         │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → FiscalError → ApiError            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (attempt, state, field)
//! 3. Errors are enum variants, never String
//! 4. An illegal state transition is a bug, not a business outcome

use thiserror::Error;

use crate::lifecycle::{AttemptState, Transition};

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A lifecycle transition that the state machine does not allow.
    ///
    /// ## When This Occurs
    /// - Completing an attempt that was never claimed
    /// - Re-arming an attempt that is not in `error`
    /// - Any caller that skipped the conditional claim
    ///
    /// This always indicates a programming error.
    #[error("Illegal transition {transition:?} from state {from}")]
    InvalidTransition {
        from: AttemptState,
        transition: Transition,
    },

    /// Completion was requested without a usable authorization.
    #[error("Cannot complete attempt: {reason}")]
    IncompleteAuthorization { reason: String },

    /// A numeric code received from storage or the authority is not known.
    #[error("Unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before anything is sent to the authority, so a validation failure
/// never consumes an invoice number.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Invalid format (e.g., CUIT with a bad check digit).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Amounts that should add up do not.
    #[error("{field} is {actual} but the components add up to {expected}")]
    Mismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// Combination of values the authority does not accept.
    #[error("{field}: {reason}")]
    NotAllowed { field: String, reason: String },
}

impl ValidationError {
    pub(crate) fn required(field: &str) -> Self {
        ValidationError::Required {
            field: field.to_string(),
        }
    }

    pub(crate) fn not_allowed(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::NotAllowed {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = CoreError::InvalidTransition {
            from: AttemptState::Completed,
            transition: Transition::Rearm,
        };
        assert_eq!(err.to_string(), "Illegal transition Rearm from state completed");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::required("sale_id");
        assert_eq!(err.to_string(), "sale_id is required");

        let err = ValidationError::Mismatch {
            field: "total".to_string(),
            expected: "121.00".to_string(),
            actual: "120.00".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "total is 120.00 but the components add up to 121.00"
        );
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let core_err: CoreError = ValidationError::required("cuit").into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
