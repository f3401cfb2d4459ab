//! # Fiscal Error Types
//!
//! Error types for everything that talks to the tax authority.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Fiscal Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Authentication  │  │   Sequencing    │  │     Transport           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │ AuthUnavailable │  │ SequenceConflict│  │  TransportFailure       │ │
//! │  │ CertificateInv. │  │ ClaimLost       │  │  (timeout, DNS, XML)    │ │
//! │  │                 │  │                 │  │  Unsent (never sent)    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Business     │  │   Invariants    │  │   Local / Ambient       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │ BusinessReject. │  │ InvariantViol.  │  │  Config, Database,      │ │
//! │  │ (classified)    │  │ (never retried) │  │  Domain, NotFound       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Strategy
//!
//! | Error              | Strategy                                  |
//! |--------------------|-------------------------------------------|
//! | AuthUnavailable    | retry with backoff                        |
//! | CertificateInvalid | fatal, operator must replace credentials  |
//! | SequenceConflict   | retry immediately                         |
//! | ClaimLost          | stop, the attempt belongs to another pass |
//! | TransportFailure   | safe to retry the whole flow              |
//! | Unsent             | retry, any reserved number is unused      |
//! | BusinessRejection  | retry only if the class allows it         |
//! | InvariantViolation | fatal, logged loudly                      |

use std::time::Duration;

use thiserror::Error;

use fiscal_core::{CoreError, DocumentType, Rejection};
use fiscal_db::DbError;

/// Result type alias for fiscal operations.
pub type FiscalResult<T> = Result<T, FiscalError>;

/// Fiscal error type covering every failure of the authorization flow.
#[derive(Debug, Error)]
pub enum FiscalError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid fiscal configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The authentication service could not issue a ticket.
    #[error("Authentication service unavailable: {0}")]
    AuthUnavailable(String),

    /// The configured certificate/key pair cannot produce a valid request.
    #[error("Certificate invalid: {0}")]
    CertificateInvalid(String),

    // =========================================================================
    // Sequencing Errors
    // =========================================================================
    /// Another submission holds the numbering lock for this tuple.
    #[error(
        "Sequence lock for POS {point_of_sale} {document_type:?} busy after {waited:?}"
    )]
    SequenceConflict {
        point_of_sale: u32,
        document_type: DocumentType,
        waited: Duration,
    },

    /// The attempt was reclaimed by a later pass while this one ran.
    #[error("Attempt {id} was reclaimed by pass {current} while pass {claimed} ran")]
    ClaimLost { id: String, claimed: u32, current: u32 },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Timeout, dropped connection or unreadable response. The authority may
    /// have acted on the request.
    #[error("Transport failure during {operation}: {reason}")]
    TransportFailure {
        operation: &'static str,
        reason: String,
    },

    /// No connection was made, so the request never reached the authority.
    #[error("Request not sent during {operation}: {reason}")]
    Unsent {
        operation: &'static str,
        reason: String,
    },

    // =========================================================================
    // Business Errors
    // =========================================================================
    /// The authority rejected the request under its rules.
    #[error("Rejected by the authority ({}): {}", .0.class.as_str(), .0.cause())]
    BusinessRejection(Rejection),

    // =========================================================================
    // Invariant Errors
    // =========================================================================
    /// A state transition or data shape that must never happen.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Invoice data failed local validation.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Database failure.
    #[error("Database error: {0}")]
    Database(DbError),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// A background task's channel is closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl FiscalError {
    pub fn transport(operation: &'static str, reason: impl Into<String>) -> Self {
        FiscalError::TransportFailure {
            operation,
            reason: reason.into(),
        }
    }

    pub fn unsent(operation: &'static str, reason: impl Into<String>) -> Self {
        FiscalError::Unsent {
            operation,
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        FiscalError::TransportFailure {
            operation,
            reason: format!("timed out after {:?}", after),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        FiscalError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<DbError> for FiscalError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::StateConflict { id, expected } => FiscalError::InvariantViolation(format!(
                "attempt {} was expected in state {}",
                id, expected
            )),
            DbError::ClaimLost {
                id,
                claimed,
                current,
            } => FiscalError::ClaimLost {
                id,
                claimed,
                current,
            },
            DbError::NotFound { entity, id } => FiscalError::NotFound { entity, id },
            DbError::Domain(e) => FiscalError::Domain(e),
            other => FiscalError::Database(other),
        }
    }
}

impl From<reqwest::Error> for FiscalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() && !err.is_timeout() {
            return FiscalError::unsent("connect", err.to_string());
        }
        let operation = if err.is_timeout() {
            "request (timeout)"
        } else {
            "request"
        };
        FiscalError::transport(operation, err.to_string())
    }
}

impl From<quick_xml::Error> for FiscalError {
    fn from(err: quick_xml::Error) -> Self {
        FiscalError::transport("parse response", format!("malformed XML: {}", err))
    }
}

impl From<openssl::error::ErrorStack> for FiscalError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        FiscalError::CertificateInvalid(err.to_string())
    }
}

impl From<std::io::Error> for FiscalError {
    fn from(err: std::io::Error) -> Self {
        FiscalError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for FiscalError {
    fn from(err: toml::de::Error) -> Self {
        FiscalError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for FiscalError {
    fn from(err: toml::ser::Error) -> Self {
        FiscalError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl FiscalError {
    /// Returns true if the whole flow may be run again later.
    ///
    /// ## Retryable Errors
    /// - Authentication service unavailable
    /// - Sequence lock contention
    /// - Transport failures, sent or not
    /// - Rejections whose class is retryable (expired credentials)
    pub fn is_retryable(&self) -> bool {
        match self {
            FiscalError::AuthUnavailable(_)
            | FiscalError::SequenceConflict { .. }
            | FiscalError::TransportFailure { .. }
            | FiscalError::Unsent { .. } => true,
            FiscalError::BusinessRejection(rejection) => rejection.class.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if an operator has to intervene.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FiscalError::CertificateInvalid(_)
                | FiscalError::InvariantViolation(_)
                | FiscalError::InvalidConfig(_)
        )
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FiscalError::InvalidConfig(_)
            | FiscalError::ConfigLoadFailed(_)
            | FiscalError::ConfigSaveFailed(_) => "config",
            FiscalError::AuthUnavailable(_) => "auth_unavailable",
            FiscalError::CertificateInvalid(_) => "certificate_invalid",
            FiscalError::SequenceConflict { .. } => "sequence_conflict",
            FiscalError::ClaimLost { .. } => "claim_lost",
            FiscalError::TransportFailure { .. } | FiscalError::Unsent { .. } => "transport_failure",
            FiscalError::BusinessRejection(_) => "business_rejection",
            FiscalError::InvariantViolation(_) => "invariant_violation",
            FiscalError::Domain(_) => "validation",
            FiscalError::NotFound { .. } => "not_found",
            FiscalError::Database(DbError::UniqueViolation { .. }) => "duplicate",
            FiscalError::Database(_) => "database",
            FiscalError::ChannelClosed(_) => "unavailable",
        }
    }
}
