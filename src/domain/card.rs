//! Credit card entity.
//!
//! The stored balance is the amount owed. Available credit is always
//! derived as limit minus balance, never stored, so the two can never
//! disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountStatus;
use super::error::LedgerError;
use super::money::Money;

/// A revolving credit card.
///
/// # Invariants
/// - `0 <= balance <= limit` at the end of every operation
/// - `balance` and `limit` share one currency, fixed at issue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCard {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub display_name: String,
    pub limit: Money,
    /// Amount currently owed.
    pub balance: Money,
    #[serde(default)]
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl CreditCard {
    /// Issue a card with a zero balance owed.
    pub fn issue(
        id: Uuid,
        owner_id: Uuid,
        display_name: String,
        limit: Money,
    ) -> Result<Self, LedgerError> {
        if display_name.trim().is_empty() {
            return Err(LedgerError::validation("display name must not be empty"));
        }
        if !limit.is_positive() {
            return Err(LedgerError::validation(format!(
                "credit limit must be positive, got {limit}"
            )));
        }
        Ok(Self {
            id,
            owner_id,
            display_name,
            balance: Money::zero(limit.currency.clone()),
            limit,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        })
    }

    pub fn ensure_active(&self) -> Result<(), LedgerError> {
        if self.status != AccountStatus::Active {
            return Err(LedgerError::Closed {
                entity: "Card",
                id: self.id,
            });
        }
        Ok(())
    }

    /// Credit still available for charges.
    pub fn available_credit(&self) -> Money {
        Money::new(
            self.limit.minor - self.balance.minor,
            self.limit.currency.clone(),
        )
    }

    fn ensure_currency(&self, amount: &Money) -> Result<(), LedgerError> {
        if amount.currency != self.limit.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.limit.currency.clone(),
                actual: amount.currency.clone(),
            });
        }
        Ok(())
    }

    /// Record a purchase, increasing the amount owed.
    pub fn charged(&self, amount: &Money) -> Result<Self, LedgerError> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        let next_balance = self.balance.checked_add(amount)?;
        if next_balance.minor > self.limit.minor {
            return Err(LedgerError::CreditLimitExceeded {
                requested: amount.clone(),
                available: self.available_credit(),
            });
        }
        let mut next = self.clone();
        next.balance = next_balance;
        Ok(next)
    }

    /// Record a repayment, decreasing the amount owed. Repaying more than
    /// is owed is refused outright rather than clamped.
    pub fn repaid(&self, amount: &Money) -> Result<Self, LedgerError> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        if amount.minor > self.balance.minor {
            return Err(LedgerError::OverRepayment {
                requested: amount.clone(),
                owed: self.balance.clone(),
            });
        }
        let mut next = self.clone();
        next.balance = self.balance.checked_sub(amount)?;
        Ok(next)
    }
}
