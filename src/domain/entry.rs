//! Ledger entries.
//!
//! The immutable audit trail. One entry per account-touching leg of an
//! operation; multi-leg operations share a correlation id. Amounts are
//! signed by their effect on the owning record's balance (for a card the
//! balance is the amount owed), so replaying completed entries in account
//! version order reproduces the stored balance exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::money::Money;

/// What kind of operation produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
    CryptoBuy,
    CryptoSell,
    CardCharge,
    CardRepayment,
    /// Operator correction compensating an earlier entry.
    Reversal,
}

impl EntryKind {
    /// Kinds an operator may reverse. Crypto entries are excluded: the
    /// position has already changed hands and money-only compensation
    /// would break replay.
    pub fn is_reversible(&self) -> bool {
        matches!(
            self,
            EntryKind::Deposit
                | EntryKind::Withdrawal
                | EntryKind::TransferIn
                | EntryKind::TransferOut
                | EntryKind::CardCharge
                | EntryKind::CardRepayment
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::TransferIn => "transfer_in",
            EntryKind::TransferOut => "transfer_out",
            EntryKind::CryptoBuy => "crypto_buy",
            EntryKind::CryptoSell => "crypto_sell",
            EntryKind::CardCharge => "card_charge",
            EntryKind::CardRepayment => "card_repayment",
            EntryKind::Reversal => "reversal",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Completed,
    /// A leg that was applied and then compensated; kept for audit,
    /// ignored by replay.
    Failed,
    /// Completed, later undone by a reversal entry.
    Reversed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Reversed => "reversed",
        };
        f.write_str(name)
    }
}

/// One immutable audit record.
///
/// Monetary fields are frozen at creation. The only permitted mutation is
/// the status flip `completed -> reversed` performed by a reversal, which
/// leaves the arithmetic contribution of the entry unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Account or card record this leg touched.
    pub account_id: Uuid,
    pub kind: EntryKind,
    pub status: EntryStatus,
    /// Signed effect on the record's balance.
    pub amount: Money,
    /// Record balance immediately after this leg committed.
    pub balance_after: Money,
    /// Record version written by this leg; orders entries per account.
    pub account_version: i64,
    pub description: String,
    /// Shared by every leg of one operation.
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<Uuid>,
    pub caller_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_credit(&self) -> bool {
        self.amount.minor > 0
    }

    /// True when replay counts this entry. `reversed` entries still count;
    /// their compensating reversal entry carries the opposite amount.
    pub fn counts_for_replay(&self) -> bool {
        matches!(self.status, EntryStatus::Completed | EntryStatus::Reversed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Currency;

    fn entry(kind: EntryKind, status: EntryStatus, minor: i64) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            kind,
            status,
            amount: Money::new(minor, Currency::usd()),
            balance_after: Money::new(minor.max(0), Currency::usd()),
            account_version: 1,
            description: "test".to_string(),
            correlation_id: Uuid::new_v4(),
            idempotency_key: None,
            caller_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_counts_completed_and_reversed() {
        assert!(entry(EntryKind::Deposit, EntryStatus::Completed, 100).counts_for_replay());
        assert!(entry(EntryKind::Deposit, EntryStatus::Reversed, 100).counts_for_replay());
        assert!(!entry(EntryKind::Deposit, EntryStatus::Failed, 100).counts_for_replay());
    }

    #[test]
    fn test_reversible_kinds() {
        assert!(EntryKind::Deposit.is_reversible());
        assert!(EntryKind::CardCharge.is_reversible());
        assert!(!EntryKind::CryptoBuy.is_reversible());
        assert!(!EntryKind::Reversal.is_reversible());
    }

    #[test]
    fn test_serde_kind_names() {
        let json = serde_json::to_string(&EntryKind::CryptoBuy).unwrap();
        assert_eq!(json, "\"crypto_buy\"");
        let json = serde_json::to_string(&EntryStatus::Reversed).unwrap();
        assert_eq!(json, "\"reversed\"");
    }
}
