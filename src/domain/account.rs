//! Account entity.
//!
//! A bank-style account holding a single-currency fiat balance. State
//! transitions return updated copies so the engine can stage conditional
//! writes; the balance is only ever changed together with a matching
//! ledger entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::LedgerError;
use super::money::{Currency, Money};

/// Account product kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Checking,
    Savings,
    Investment,
}

/// Who the account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Personal,
    Business,
    Kids,
}

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Closed,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// External routing identifiers. Domestic transfers use a BSB, cross-border
/// ones a SWIFT BIC; either may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Routing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bsb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swift_bic: Option<String>,
}

impl Routing {
    /// Validate formats: BSB is six digits (a `xxx-xxx` separator is
    /// accepted and stripped), BIC is 8 or 11 uppercase alphanumerics.
    pub fn normalized(mut self) -> Result<Self, LedgerError> {
        if let Some(bsb) = self.bsb.take() {
            let digits: String = bsb.chars().filter(|c| *c != '-').collect();
            if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(LedgerError::validation(format!("invalid BSB: {bsb:?}")));
            }
            self.bsb = Some(digits);
        }
        if let Some(bic) = self.swift_bic.take() {
            let bic = bic.to_ascii_uppercase();
            let ok = (bic.len() == 8 || bic.len() == 11)
                && bic.chars().all(|c| c.is_ascii_alphanumeric());
            if !ok {
                return Err(LedgerError::validation(format!("invalid SWIFT BIC: {bic:?}")));
            }
            self.swift_bic = Some(bic);
        }
        Ok(self)
    }
}

/// A customer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: AccountKind,
    pub owner_type: OwnerType,
    pub display_name: String,
    /// Human-facing account number, derived from the id at open time.
    pub number: String,
    pub currency: Currency,
    pub balance: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
    #[serde(default)]
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Open a new account with a zero balance.
    pub fn open(
        id: Uuid,
        owner_id: Uuid,
        kind: AccountKind,
        owner_type: OwnerType,
        display_name: String,
        currency: Currency,
        routing: Option<Routing>,
    ) -> Result<Self, LedgerError> {
        if display_name.trim().is_empty() {
            return Err(LedgerError::validation("display name must not be empty"));
        }
        let routing = routing.map(Routing::normalized).transpose()?;
        Ok(Self {
            id,
            owner_id,
            kind,
            owner_type,
            display_name,
            number: format!("{:09}", id.as_u128() % 1_000_000_000),
            balance: Money::zero(currency.clone()),
            currency,
            routing,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn ensure_active(&self) -> Result<(), LedgerError> {
        if !self.is_active() {
            return Err(LedgerError::Closed {
                entity: "Account",
                id: self.id,
            });
        }
        Ok(())
    }

    /// Fail unless `amount` is denominated in this account's currency.
    pub fn ensure_currency(&self, amount: &Money) -> Result<(), LedgerError> {
        if amount.currency != self.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: amount.currency.clone(),
            });
        }
        Ok(())
    }

    /// Credit the balance. `amount` must be positive and currency-matched.
    pub fn credited(&self, amount: &Money) -> Result<Self, LedgerError> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        let mut next = self.clone();
        next.balance = self.balance.checked_add(amount)?;
        Ok(next)
    }

    /// Debit the balance, refusing to go below zero.
    pub fn debited(&self, amount: &Money) -> Result<Self, LedgerError> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        if self.balance.minor < amount.minor {
            return Err(LedgerError::InsufficientFunds {
                required: amount.clone(),
                available: self.balance.clone(),
            });
        }
        let mut next = self.clone();
        next.balance = self.balance.checked_sub(amount)?;
        Ok(next)
    }

    /// Soft-close. Refused while funds remain; the engine additionally
    /// refuses while crypto positions are open.
    pub fn closed(&self) -> Result<Self, LedgerError> {
        self.ensure_active()?;
        if !self.balance.is_zero() {
            return Err(LedgerError::validation(format!(
                "account {} still holds {}",
                self.id, self.balance
            )));
        }
        let mut next = self.clone();
        next.status = AccountStatus::Closed;
        Ok(next)
    }
}
