//! # API Error Type
//!
//! What HTTP callers receive when a request fails.
//!
//! ```json
//! { "code": "not_found", "message": "InvoiceAttempt not found: sale-9" }
//! ```
//!
//! `code` is the engine's stable error code. Internal failures are logged
//! in full and reported with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use fiscal_core::CoreError;
use fiscal_db::DbError;
use fiscal_engine::FiscalError;

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,

    /// Machine-readable error code
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<FiscalError> for ApiError {
    fn from(err: FiscalError) -> Self {
        let code = err.code();
        let status = match code {
            "validation" | "business_rejection" => StatusCode::UNPROCESSABLE_ENTITY,
            "not_found" => StatusCode::NOT_FOUND,
            "duplicate" | "sequence_conflict" | "claim_lost" => StatusCode::CONFLICT,
            "auth_unavailable" | "transport_failure" | "unavailable" => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &err {
            FiscalError::Database(_) | FiscalError::InvariantViolation(_) => {
                error!(error = %err, "Request failed internally");
                "internal error, see service logs".to_string()
            }
            _ => err.to_string(),
        };

        ApiError::new(status, code, message)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        FiscalError::from(err).into()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        FiscalError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let not_found: ApiError = FiscalError::not_found("InvoiceAttempt", "sale-9").into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.code, "not_found");
        assert_eq!(not_found.message, "InvoiceAttempt not found: sale-9");

        let transport: ApiError = FiscalError::timeout("FEDummy", Duration::from_secs(15)).into();
        assert_eq!(transport.status, StatusCode::SERVICE_UNAVAILABLE);

        let invariant: ApiError = FiscalError::InvariantViolation("boom".into()).into();
        assert_eq!(invariant.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!invariant.message.contains("boom"));

        let reclaimed: ApiError = FiscalError::ClaimLost {
            id: "a-1".into(),
            claimed: 1,
            current: 2,
        }
        .into();
        assert_eq!(reclaimed.status, StatusCode::CONFLICT);
        assert_eq!(reclaimed.code, "claim_lost");
    }
}
