//! Internal transfers.
//!
//! Two legs against two accounts, committed debit-first. Both entries share
//! the operation's correlation id; either both legs settle or the applied
//! leg is compensated and the attempt retried.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerError, Money, OperationContext};
use crate::store::{encode, EntityKind, EntityStore};

use super::commit::WritePlan;
use super::{build_entry, ensure_positive, load_account, LedgerEngine, Operation, OperationReceipt};

/// Move funds between two accounts held in this ledger.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Money,
    pub memo: String,
}

#[async_trait]
impl Operation for Transfer {
    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let from = load_account(store, self.from_account_id).await?;
        let to = load_account(store, self.to_account_id).await?;

        // Re-validate against fresh state every attempt
        let debited = from.entity.debited(&self.amount)?;
        let credited = to.entity.credited(&self.amount)?;

        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Account,
            self.from_account_id,
            from.version,
            encode(&debited)?,
            Some(from.prior),
        );
        plan.put(
            EntityKind::Account,
            self.to_account_id,
            to.version,
            encode(&credited)?,
            Some(to.prior),
        );
        plan.record(build_entry(
            self.from_account_id,
            EntryKind::TransferOut,
            self.amount.negated(),
            debited.balance.clone(),
            from.version + 1,
            self.memo.clone(),
            ctx,
            key,
        ));
        plan.record(build_entry(
            self.to_account_id,
            EntryKind::TransferIn,
            self.amount.clone(),
            credited.balance.clone(),
            to.version + 1,
            self.memo.clone(),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

impl LedgerEngine {
    /// Transfer between two ledger accounts.
    pub async fn transfer(
        &self,
        op: Transfer,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        if op.from_account_id == op.to_account_id {
            return Err(LedgerError::SameAccount);
        }
        ensure_positive(&op.amount)?;
        let request = json!({
            "op": "transfer",
            "from_account_id": op.from_account_id,
            "to_account_id": op.to_account_id,
            "amount": op.amount,
            "memo": op.memo,
        });
        self.run_operation(op, key, request, ctx).await
    }
}
