//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::LedgerError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    // Ledger errors
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }
            AppError::MissingHeader(header) => {
                (StatusCode::BAD_REQUEST, "missing_header", Some(header.clone()))
            }

            // Ledger errors map per outcome class
            AppError::Ledger(ref err) => match err {
                // 400: the request itself is malformed
                LedgerError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "validation_failed", Some(msg.clone()))
                }
                LedgerError::CurrencyMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "currency_mismatch", Some(err.to_string()))
                }
                LedgerError::SameAccount => {
                    (StatusCode::BAD_REQUEST, "same_account", None)
                }

                // 403: the caller is known but not allowed
                LedgerError::Unauthorized(msg) => {
                    (StatusCode::FORBIDDEN, "unauthorized", Some(msg.clone()))
                }

                // 404
                LedgerError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "not_found", Some(err.to_string()))
                }

                // 409: state raced the request; resubmission may succeed
                LedgerError::Contention { .. } => {
                    (StatusCode::CONFLICT, "contention", Some(err.to_string()))
                }
                LedgerError::IdempotencyConflict { .. } => {
                    (StatusCode::CONFLICT, "idempotency_conflict", Some(err.to_string()))
                }
                LedgerError::PartialFailureRecovered(detail) => {
                    (StatusCode::CONFLICT, "partial_failure_recovered", Some(detail.clone()))
                }

                // 422: well-formed request refused by a business rule
                LedgerError::InsufficientFunds { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds", Some(err.to_string()))
                }
                LedgerError::InsufficientPosition { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_position", Some(err.to_string()))
                }
                LedgerError::CreditLimitExceeded { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "credit_limit_exceeded", Some(err.to_string()))
                }
                LedgerError::OverRepayment { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "over_repayment", Some(err.to_string()))
                }
                LedgerError::Closed { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "closed", Some(err.to_string()))
                }

                // 503: the rate feed is down, not the ledger
                LedgerError::PriceUnavailable(msg) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "price_unavailable", Some(msg.clone()))
                }

                // 500
                LedgerError::Inconsistent(detail) => {
                    tracing::error!(detail = %detail, "inconsistent ledger surfaced to API");
                    (StatusCode::INTERNAL_SERVER_ERROR, "inconsistent", None)
                }
                LedgerError::Store(msg) => {
                    tracing::error!("Store error: {}", msg);
                    (StatusCode::INTERNAL_SERVER_ERROR, "store_error", None)
                }
                LedgerError::Cancelled => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "operation_cancelled", None)
                }
            },
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, Money};
    use uuid::Uuid;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_validation_maps_to_400() {
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::validation("bad amount"))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::SameAccount)),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_business_refusals_map_to_422() {
        let refusal = LedgerError::InsufficientFunds {
            required: Money::new(6_000, Currency::aud()),
            available: Money::new(4_000, Currency::aud()),
        };
        assert_eq!(status_of(AppError::Ledger(refusal)), StatusCode::UNPROCESSABLE_ENTITY);

        let limit = LedgerError::CreditLimitExceeded {
            requested: Money::new(150_000, Currency::aud()),
            available: Money::new(100_000, Currency::aud()),
        };
        assert_eq!(status_of(AppError::Ledger(limit)), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_conflicts_map_to_409() {
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::Contention { attempts: 5 })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::IdempotencyConflict {
                key: Uuid::new_v4(),
                detail: "hash mismatch".to_string(),
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::PartialFailureRecovered(
                "rolled back".to_string()
            ))),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_not_found_and_outage() {
        let missing = LedgerError::not_found("Account", Uuid::new_v4());
        assert_eq!(status_of(AppError::Ledger(missing)), StatusCode::NOT_FOUND);

        let outage = LedgerError::PriceUnavailable("feed down".to_string());
        assert_eq!(
            status_of(AppError::Ledger(outage)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_inconsistent_maps_to_500() {
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::Inconsistent("comp failed".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::Ledger(LedgerError::Store("io".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
