//! Operator-initiated reversal of a committed entry.
//!
//! The original entry is never edited beyond its status flip: the
//! correction is a new `reversal` entry in the opposite direction, sharing
//! the original's correlation id so the pair reads as one story. Both the
//! balance change and the status flip land in one atomic plan.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{
    Account, CreditCard, EntryKind, EntryStatus, LedgerEntry, LedgerError, OperationContext,
};
use crate::store::{encode, EntityKind, EntityStore};

use super::commit::WritePlan;
use super::{build_entry, load_account, load_card, LedgerEngine, Operation, OperationReceipt};

/// Reverse one completed ledger entry.
#[derive(Debug, Clone)]
pub struct ReverseEntry {
    pub entry_id: Uuid,
}

#[async_trait]
impl Operation for ReverseEntry {
    fn name(&self) -> &'static str {
        "reverse_entry"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let record = store
            .get(EntityKind::Entry, self.entry_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Entry", self.entry_id))?;
        let original: LedgerEntry = record.decode()?;

        if original.status != EntryStatus::Completed {
            return Err(LedgerError::validation(format!(
                "entry {} is {}, only completed entries can be reversed",
                original.id, original.status
            )));
        }
        if !original.kind.is_reversible() {
            return Err(LedgerError::validation(format!(
                "{} entries cannot be reversed (entry {})",
                original.kind, original.id
            )));
        }

        // Undo the original's effect on the record it touched
        let delta = original.amount.negated();
        let magnitude = delta.abs();

        let mut plan = WritePlan::new();
        let (balance_after, target_version) = match original.kind {
            EntryKind::CardCharge | EntryKind::CardRepayment => {
                let card = load_card(store, original.account_id).await?;
                let updated: CreditCard = if delta.is_negative() {
                    card.entity.repaid(&magnitude)?
                } else {
                    card.entity.charged(&magnitude)?
                };
                let balance = updated.balance.clone();
                plan.put(
                    EntityKind::Card,
                    original.account_id,
                    card.version,
                    encode(&updated)?,
                    Some(card.prior),
                );
                (balance, card.version)
            }
            _ => {
                let account = load_account(store, original.account_id).await?;
                let updated: Account = if delta.is_negative() {
                    account.entity.debited(&magnitude)?
                } else {
                    account.entity.credited(&magnitude)?
                };
                let balance = updated.balance.clone();
                plan.put(
                    EntityKind::Account,
                    original.account_id,
                    account.version,
                    encode(&updated)?,
                    Some(account.prior),
                );
                (balance, account.version)
            }
        };

        // Flip the original to reversed; monetary fields stay frozen
        let mut flipped = original.clone();
        flipped.status = EntryStatus::Reversed;
        plan.put(
            EntityKind::Entry,
            original.id,
            record.version,
            encode(&flipped)?,
            Some(record.payload),
        );

        let mut reversal = build_entry(
            original.account_id,
            EntryKind::Reversal,
            delta,
            balance_after,
            target_version + 1,
            format!("Reversal of entry {}: {}", original.id, original.description),
            ctx,
            key,
        );
        // The pair shares the original's correlation id
        reversal.correlation_id = original.correlation_id;
        plan.record(reversal);
        Ok(plan)
    }
}

impl LedgerEngine {
    /// Reverse a completed entry. Operator role required.
    pub async fn reverse_entry(
        &self,
        op: ReverseEntry,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        if !ctx.role.is_operator() {
            return Err(LedgerError::Unauthorized(
                "reversals require the operator role".to_string(),
            ));
        }
        let request = json!({
            "op": "reverse_entry",
            "entry_id": op.entry_id,
        });
        self.run_operation(op, key, request, ctx).await
    }
}
