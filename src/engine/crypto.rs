//! Crypto buys and sells.
//!
//! Executed against the oracle rate, never the caller's quoted rate: the
//! quote at submission is recorded in the entry description for audit, but
//! pricing happens at the single quote fetched for this operation. Cost
//! and proceeds round half away from zero to whole minor units.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{CryptoPosition, EntryKind, LedgerError, Money, OperationContext, Quantity, Symbol};
use crate::oracle::{PriceOracle, Quote};
use crate::store::{encode, EntityKind, EntityStore};

use super::commit::WritePlan;
use super::{build_entry, load_account, load_position, LedgerEngine, Operation, OperationReceipt};

/// Buy a crypto asset with fiat from an account.
#[derive(Debug, Clone)]
pub struct CryptoBuy {
    pub account_id: Uuid,
    pub symbol: Symbol,
    pub quantity: Quantity,
    /// Rate shown to the caller at submission time, recorded for audit.
    pub quoted_rate: Option<Money>,
}

/// Sell a held crypto asset back into fiat.
#[derive(Debug, Clone)]
pub struct CryptoSell {
    pub account_id: Uuid,
    pub symbol: Symbol,
    pub quantity: Quantity,
}

/// Fetch the operation's single quote, priced in the account's currency.
async fn fetch_quote(
    store: &dyn EntityStore,
    oracle: &dyn PriceOracle,
    account_id: Uuid,
    symbol: &Symbol,
) -> Result<Quote, LedgerError> {
    let account = load_account(store, account_id).await?.entity;
    let quote = oracle.crypto_quote(symbol, &account.currency).await?;
    if !quote.rate.is_positive() {
        return Err(LedgerError::PriceUnavailable(format!(
            "non-positive rate for {symbol}: {}",
            quote.rate
        )));
    }
    Ok(quote)
}

fn quote_or_bug(quote: &Option<Quote>) -> Result<&Quote, LedgerError> {
    quote
        .as_ref()
        .ok_or_else(|| LedgerError::Store("operation planned before its quote was fetched".into()))
}

struct BuyOp {
    args: CryptoBuy,
    quote: Option<Quote>,
}

#[async_trait]
impl Operation for BuyOp {
    fn name(&self) -> &'static str {
        "crypto_buy"
    }

    async fn prepare(
        &mut self,
        store: &dyn EntityStore,
        oracle: &dyn PriceOracle,
    ) -> Result<(), LedgerError> {
        let quote = fetch_quote(store, oracle, self.args.account_id, &self.args.symbol).await?;
        self.quote = Some(quote);
        Ok(())
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let quote = quote_or_bug(&self.quote)?;
        let args = &self.args;

        let account = load_account(store, args.account_id).await?;
        let cost = quote.rate.scaled(args.quantity.value())?;
        // Funds are re-checked against fresh state on every attempt
        let debited = account.entity.debited(&cost)?;

        let position_id = CryptoPosition::position_id(args.account_id, &args.symbol);
        let mut plan = WritePlan::new();
        plan.put(
            EntityKind::Account,
            args.account_id,
            account.version,
            encode(&debited)?,
            Some(account.prior),
        );

        match load_position(store, position_id).await? {
            Some(position) => {
                let updated = position.entity.bought(args.quantity, &quote.rate)?;
                plan.put(
                    EntityKind::Position,
                    position_id,
                    position.version,
                    encode(&updated)?,
                    Some(position.prior),
                );
            }
            None => {
                let opened = CryptoPosition::opened(
                    args.account_id,
                    args.symbol.clone(),
                    args.quantity,
                    &quote.rate,
                );
                plan.put(EntityKind::Position, position_id, 0, encode(&opened)?, None);
            }
        }

        let mut description = format!(
            "Buy {} {} @ {} ({})",
            args.quantity, args.symbol, quote.rate, quote.source
        );
        if let Some(quoted) = &args.quoted_rate {
            description.push_str(&format!("; quoted {quoted} at submission"));
        }

        plan.record(build_entry(
            args.account_id,
            EntryKind::CryptoBuy,
            cost.negated(),
            debited.balance.clone(),
            account.version + 1,
            description,
            ctx,
            key,
        ));
        Ok(plan)
    }
}

struct SellOp {
    args: CryptoSell,
    quote: Option<Quote>,
}

#[async_trait]
impl Operation for SellOp {
    fn name(&self) -> &'static str {
        "crypto_sell"
    }

    async fn prepare(
        &mut self,
        store: &dyn EntityStore,
        oracle: &dyn PriceOracle,
    ) -> Result<(), LedgerError> {
        let quote = fetch_quote(store, oracle, self.args.account_id, &self.args.symbol).await?;
        self.quote = Some(quote);
        Ok(())
    }

    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError> {
        let quote = quote_or_bug(&self.quote)?;
        let args = &self.args;

        let position_id = CryptoPosition::position_id(args.account_id, &args.symbol);
        let position = load_position(store, position_id).await?.ok_or_else(|| {
            LedgerError::InsufficientPosition {
                symbol: args.symbol.clone(),
                requested: args.quantity.value(),
                held: rust_decimal::Decimal::ZERO,
            }
        })?;

        let account = load_account(store, args.account_id).await?;
        let proceeds = quote.rate.scaled(args.quantity.value())?;
        let credited = account.entity.credited(&proceeds)?;

        let mut plan = WritePlan::new();
        // Reduce the position first; the fiat credit follows
        match position.entity.sold(args.quantity)? {
            Some(remaining) => plan.put(
                EntityKind::Position,
                position_id,
                position.version,
                encode(&remaining)?,
                Some(position.prior),
            ),
            // Liquidated exactly: the record is deleted, not zeroed
            None => plan.delete(EntityKind::Position, position_id, position.version, position.prior),
        }
        plan.put(
            EntityKind::Account,
            args.account_id,
            account.version,
            encode(&credited)?,
            Some(account.prior),
        );

        plan.record(build_entry(
            args.account_id,
            EntryKind::CryptoSell,
            proceeds,
            credited.balance.clone(),
            account.version + 1,
            format!(
                "Sell {} {} @ {} ({})",
                args.quantity, args.symbol, quote.rate, quote.source
            ),
            ctx,
            key,
        ));
        Ok(plan)
    }
}

impl LedgerEngine {
    /// Buy crypto at the oracle rate, debiting the fiat account.
    pub async fn crypto_buy(
        &self,
        op: CryptoBuy,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        if let Some(quoted) = &op.quoted_rate {
            if !quoted.is_positive() {
                return Err(LedgerError::validation(format!(
                    "quoted rate must be positive, got {quoted}"
                )));
            }
        }
        let request = json!({
            "op": "crypto_buy",
            "account_id": op.account_id,
            "symbol": op.symbol,
            "quantity": op.quantity,
            "quoted_rate": op.quoted_rate,
        });
        self.run_operation(BuyOp { args: op, quote: None }, key, request, ctx)
            .await
    }

    /// Sell held crypto at the oracle rate, crediting the fiat account.
    pub async fn crypto_sell(
        &self,
        op: CryptoSell,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        let request = json!({
            "op": "crypto_sell",
            "account_id": op.account_id,
            "symbol": op.symbol,
            "quantity": op.quantity,
        });
        self.run_operation(SellOp { args: op, quote: None }, key, request, ctx)
            .await
    }
}
