//! Card charges and repayments.
//!
//! A charge touches only the card record. A repayment is a two-leg
//! operation: the funding account is debited and the card's owed balance
//! drops, with one entry per record sharing the correlation id.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerError, Money, OperationContext};
use crate::store::{encode, EntityKind, EntityStore};

use super::commit::WritePlan;
use super::{
    build_entry, ensure_positive, load_account, load_card, LedgerEngine, Operation,
    OperationReceipt,
};

/// Charge a purchase to a credit card.
#[derive(Debug, Clone)]
pub struct CardCharge {
    pub card_id: Uuid,
    pub amount: Money,
    pub merchant: String,
}

/// Pay down a card's owed balance from an account.
#[derive(Debug, Clone)]
pub struct CardRepayment {
    pub card_id: Uuid,
    pub account_id: Uuid,
    pub amount: Money,
}

#[async_trait]
impl Operation for CardCharge {
    fn name(&self) -> &'static str {
        "card_charge"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let card = load_card(store, self.card_id).await?;
        let charged = card.entity.charged(&self.amount)?;

        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Card,
            self.card_id,
            card.version,
            encode(&charged)?,
            Some(card.prior),
        );
        // Positive amount: the card's owed balance grew
        plan.record(build_entry(
            self.card_id,
            EntryKind::CardCharge,
            self.amount.clone(),
            charged.balance.clone(),
            card.version + 1,
            format!("Charge at {}", self.merchant),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

#[async_trait]
impl Operation for CardRepayment {
    fn name(&self) -> &'static str {
        "card_repayment"
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let account = load_account(store, self.account_id).await?;
        let card = load_card(store, self.card_id).await?;

        // repaid() checks over-repayment against the card's currency; the
        // account side only needs funds in that same currency
        let debited = account.entity.debited(&self.amount)?;
        let repaid = card.entity.repaid(&self.amount)?;

        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Account,
            self.account_id,
            account.version,
            encode(&debited)?,
            Some(account.prior),
        );
        plan.put(
            EntityKind::Card,
            self.card_id,
            card.version,
            encode(&repaid)?,
            Some(card.prior),
        );

        plan.record(build_entry(
            self.account_id,
            EntryKind::Withdrawal,
            self.amount.negated(),
            debited.balance.clone(),
            account.version + 1,
            format!("Repayment to card {}", repaid.display_name),
            ctx,
            key,
        ));
        plan.record(build_entry(
            self.card_id,
            EntryKind::CardRepayment,
            self.amount.negated(),
            repaid.balance.clone(),
            card.version + 1,
            format!("Repayment from account {}", debited.number),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

impl LedgerEngine {
    /// Charge a purchase against a card's credit limit.
    pub async fn card_charge(
        &self,
        op: CardCharge,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        ensure_positive(&op.amount)?;
        if op.merchant.trim().is_empty() {
            return Err(LedgerError::validation("merchant must not be empty"));
        }
        let request = json!({
            "op": "card_charge",
            "card_id": op.card_id,
            "amount": op.amount,
            "merchant": op.merchant,
        });
        self.run_operation(op, key, request, ctx).await
    }

    /// Repay a card from an account, atomically.
    pub async fn card_repayment(
        &self,
        op: CardRepayment,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        ensure_positive(&op.amount)?;
        let request = json!({
            "op": "card_repayment",
            "card_id": op.card_id,
            "account_id": op.account_id,
            "amount": op.amount,
        });
        self.run_operation(op, key, request, ctx).await
    }
}
