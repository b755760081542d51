//! Crypto position entity.
//!
//! One position per (account, symbol) pair; the record id is derived
//! deterministically from that pair so concurrent first buys collide on
//! the same key instead of creating duplicates. A fully sold position is
//! deleted, never stored at zero.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::LedgerError;
use super::money::{Money, MoneyError, Quantity, Symbol};

/// A holding of one crypto asset in one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoPosition {
    pub account_id: Uuid,
    pub symbol: Symbol,
    pub quantity: Quantity,
    /// Volume-weighted average acquisition cost, in fiat minor units per
    /// whole unit of the asset.
    pub avg_cost: Money,
    pub updated_at: DateTime<Utc>,
}

impl CryptoPosition {
    /// Deterministic record id for an (account, symbol) pair.
    pub fn position_id(account_id: Uuid, symbol: &Symbol) -> Uuid {
        let name = format!("{}:{}", account_id, symbol);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    pub fn id(&self) -> Uuid {
        Self::position_id(self.account_id, &self.symbol)
    }

    /// Open a position with the first purchase; the average cost is the
    /// purchase rate.
    pub fn opened(account_id: Uuid, symbol: Symbol, quantity: Quantity, rate: &Money) -> Self {
        Self {
            account_id,
            symbol,
            quantity,
            avg_cost: rate.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Fold a purchase into the position:
    /// `new_avg = (old_qty * old_avg + qty * rate) / (old_qty + qty)`,
    /// rounded half away from zero to whole minor units.
    pub fn bought(&self, quantity: Quantity, rate: &Money) -> Result<Self, LedgerError> {
        rate.require_same_currency(&self.avg_cost)
            .map_err(LedgerError::from)?;

        let old_qty = self.quantity.value();
        let add_qty = quantity.value();
        let total_qty = old_qty + add_qty;

        let weighted = Decimal::from(self.avg_cost.minor) * old_qty
            + Decimal::from(rate.minor) * add_qty;
        let avg_minor = (weighted / total_qty)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .ok_or(LedgerError::from(MoneyError::Overflow))?;

        let mut next = self.clone();
        next.quantity = Quantity::new(total_qty)?;
        next.avg_cost = Money::new(avg_minor, self.avg_cost.currency.clone());
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Reduce the position by a sale. Returns `None` when the sale
    /// liquidates the holding exactly; selling more than is held fails.
    pub fn sold(&self, quantity: Quantity) -> Result<Option<Self>, LedgerError> {
        let held = self.quantity.value();
        let requested = quantity.value();
        if requested > held {
            return Err(LedgerError::InsufficientPosition {
                symbol: self.symbol.clone(),
                requested,
                held,
            });
        }

        let remaining = held - requested;
        if remaining.is_zero() {
            return Ok(None);
        }
        let mut next = self.clone();
        next.quantity = Quantity::new(remaining)?;
        next.updated_at = Utc::now();
        Ok(Some(next))
    }

    /// Total acquisition cost of the holding at the average rate.
    pub fn cost_basis(&self) -> Result<Money, LedgerError> {
        self.avg_cost
            .scaled(self.quantity.value())
            .map_err(LedgerError::from)
    }
}
