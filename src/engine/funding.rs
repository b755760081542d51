//! External deposits and withdrawals.
//!
//! Single-leg operations against one account. The external side (a card
//! network, a payout rail) is out of scope; these record the money arriving
//! at or leaving the ledger's edge.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerError, Money, OperationContext};
use crate::store::{encode, EntityKind, EntityStore};

use super::commit::WritePlan;
use super::{build_entry, ensure_positive, load_account, LedgerEngine, Operation, OperationReceipt};

/// Deposit external funds into an account.
#[derive(Debug, Clone)]
pub struct Deposit {
    pub account_id: Uuid,
    pub amount: Money,
    pub description: String,
}

/// Withdraw funds out of an account.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub account_id: Uuid,
    pub amount: Money,
    pub description: String,
}

#[async_trait]
impl Operation for Deposit {
    fn name(&self) -> &'static str {
        "deposit"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let loaded = load_account(store, self.account_id).await?;
        let updated = loaded.entity.credited(&self.amount)?;

        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Account,
            self.account_id,
            loaded.version,
            encode(&updated)?,
            Some(loaded.prior),
        );
        plan.record(build_entry(
            self.account_id,
            EntryKind::Deposit,
            self.amount.clone(),
            updated.balance.clone(),
            loaded.version + 1,
            self.description.clone(),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

#[async_trait]
impl Operation for Withdrawal {
    fn name(&self) -> &'static str {
        "withdrawal"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let loaded = load_account(store, self.account_id).await?;
        let updated = loaded.entity.debited(&self.amount)?;

        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Account,
            self.account_id,
            loaded.version,
            encode(&updated)?,
            Some(loaded.prior),
        );
        plan.record(build_entry(
            self.account_id,
            EntryKind::Withdrawal,
            self.amount.negated(),
            updated.balance.clone(),
            loaded.version + 1,
            self.description.clone(),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

impl LedgerEngine {
    /// Deposit external funds.
    pub async fn deposit(
        &self,
        op: Deposit,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        ensure_positive(&op.amount)?;
        let request = json!({
            "op": "deposit",
            "account_id": op.account_id,
            "amount": op.amount,
            "description": op.description,
        });
        self.run_operation(op, key, request, ctx).await
    }

    /// Withdraw funds, refusing to overdraw.
    pub async fn withdraw(
        &self,
        op: Withdrawal,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        ensure_positive(&op.amount)?;
        let request = json!({
            "op": "withdrawal",
            "account_id": op.account_id,
            "amount": op.amount,
            "description": op.description,
        });
        self.run_operation(op, key, request, ctx).await
    }
}
