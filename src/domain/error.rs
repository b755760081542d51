//! Domain error types.
//!
//! Business rule violations and operation outcomes, independent of the
//! transport and storage layers.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::money::{Currency, Money, MoneyError, Symbol};

/// Errors surfaced by ledger operations.
///
/// Refusals are ordinary outcomes here, not bugs: every variant except
/// `Inconsistent` leaves the stores in a state the invariants hold over.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    /// Malformed input rejected before any state was read
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Debit would take the account balance below zero
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },

    /// Sell quantity exceeds the held position
    #[error("Insufficient position in {symbol}: requested {requested}, held {held}")]
    InsufficientPosition {
        symbol: Symbol,
        requested: Decimal,
        held: Decimal,
    },

    /// Charge would push the card balance past its limit
    #[error("Credit limit exceeded: requested {requested}, available credit {available}")]
    CreditLimitExceeded { requested: Money, available: Money },

    /// Repayment exceeds the outstanding card balance
    #[error("Over-repayment: requested {requested}, owed {owed}")]
    OverRepayment { requested: Money, owed: Money },

    /// Amount currency does not match the entity it targets
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Transfer where source and destination are the same account
    #[error("Cannot transfer between an account and itself")]
    SameAccount,

    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// Entity exists but is closed to money movement
    #[error("{entity} {id} is closed")]
    Closed { entity: &'static str, id: Uuid },

    /// Caller role does not permit the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Price oracle could not produce a quote
    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    /// Retry budget exhausted without any write surviving
    #[error("Operation abandoned after {attempts} contended attempts")]
    Contention { attempts: u32 },

    /// A later leg failed; earlier legs were compensated successfully
    #[error("Operation rolled back after partial application: {0}")]
    PartialFailureRecovered(String),

    /// Idempotency key reused with a different request, or still in flight
    #[error("Idempotency conflict for key {key}: {detail}")]
    IdempotencyConflict { key: Uuid, detail: String },

    /// Compensation failed; manual reconciliation required
    #[error("Ledger inconsistent, manual reconciliation required: {0}")]
    Inconsistent(String),

    /// Caller abandoned the operation before any write was committed
    #[error("Operation cancelled before any write was committed")]
    Cancelled,

    /// Storage failure outside the optimistic-conflict protocol
    #[error("Store error: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// True when the request itself was at fault and a retry of the same
    /// request cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientFunds { .. }
                | Self::InsufficientPosition { .. }
                | Self::CreditLimitExceeded { .. }
                | Self::OverRepayment { .. }
                | Self::CurrencyMismatch { .. }
                | Self::SameAccount
                | Self::Closed { .. }
                | Self::Unauthorized(_)
        )
    }

    /// True when resubmitting the identical request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Contention { .. }
                | Self::PartialFailureRecovered(_)
                | Self::PriceUnavailable(_)
        )
    }
}

impl From<MoneyError> for LedgerError {
    fn from(err: MoneyError) -> Self {
        match err {
            MoneyError::CurrencyMismatch { expected, actual } => {
                Self::CurrencyMismatch { expected, actual }
            }
            other => Self::Validation(other.to_string()),
        }
    }
}
