//! Engine operation tests.
//!
//! Run entirely against the in-memory store; concurrency and failure paths
//! are exercised with a fault-injecting store wrapper.

use super::*;
use crate::domain::{Currency, Quantity, Role, Symbol};
use crate::oracle::{FixedRateOracle, OracleError, Quote};
use crate::store::{MemoryStore, StoreError, VersionedRecord};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn aud(minor: i64) -> Money {
    Money::new(minor, Currency::aud())
}

fn btc() -> Symbol {
    Symbol::new("BTC").unwrap()
}

fn qty(value: Decimal) -> Quantity {
    Quantity::new(value).unwrap()
}

fn customer() -> OperationContext {
    OperationContext::new(Uuid::new_v4(), Role::Customer)
}

fn operator() -> OperationContext {
    OperationContext::new(Uuid::new_v4(), Role::Operator)
}

struct Fixture {
    engine: Arc<LedgerEngine>,
    store: Arc<MemoryStore>,
    oracle: Arc<FixedRateOracle>,
}

/// Engine over a fresh in-memory store with BTC quoted at 50,000.00 AUD.
fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let oracle = Arc::new(FixedRateOracle::default());
    oracle.set_crypto_rate(btc(), aud(5_000_000));
    let engine = Arc::new(LedgerEngine::new(store.clone(), oracle.clone()));
    Fixture {
        engine,
        store,
        oracle,
    }
}

async fn open_account(fx: &Fixture, ctx: &OperationContext) -> Account {
    fx.engine
        .open_account(
            ctx.caller_id,
            AccountKind::Checking,
            OwnerType::Personal,
            "Everyday".to_string(),
            Currency::aud(),
            None,
            ctx,
        )
        .await
        .unwrap()
}

async fn funded_account(fx: &Fixture, ctx: &OperationContext, minor: i64) -> Account {
    let account = open_account(fx, ctx).await;
    fx.engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(minor),
                description: "Opening deposit".to_string(),
            },
            Uuid::new_v4(),
            ctx,
        )
        .await
        .unwrap();
    account
}

async fn stored_account(store: &dyn EntityStore, id: Uuid) -> Account {
    store
        .get(EntityKind::Account, id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap()
}

async fn stored_card(store: &dyn EntityStore, id: Uuid) -> CreditCard {
    store
        .get(EntityKind::Card, id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap()
}

async fn entries_of(store: &dyn EntityStore, id: Uuid) -> Vec<LedgerEntry> {
    store
        .entries_for_account(id, 100, 0)
        .await
        .unwrap()
        .iter()
        .map(|r| r.decode().unwrap())
        .collect()
}

/// Fold the replay-visible entries; must reproduce the stored balance.
fn replayed_minor(entries: &[LedgerEntry]) -> i64 {
    entries
        .iter()
        .filter(|e| e.counts_for_replay())
        .map(|e| e.amount.minor)
        .sum()
}

// =========================================================================
// Fault injection helpers
// =========================================================================

enum Fault {
    None,
    /// Fail the next `remaining` conditional writes to this record with a
    /// version conflict.
    Conflict {
        kind: EntityKind,
        id: Uuid,
        remaining: u32,
    },
    /// Fail every conditional write to this record with an I/O error.
    Io { kind: EntityKind, id: Uuid },
}

/// Store wrapper that injects failures into targeted writes.
struct FaultyStore {
    inner: MemoryStore,
    fault: Mutex<Fault>,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fault: Mutex::new(Fault::None),
        }
    }

    fn conflict_on(&self, kind: EntityKind, id: Uuid, times: u32) {
        *self.fault.lock().unwrap() = Fault::Conflict {
            kind,
            id,
            remaining: times,
        };
    }

    fn io_on(&self, kind: EntityKind, id: Uuid) {
        *self.fault.lock().unwrap() = Fault::Io { kind, id };
    }

    fn intercept(&self, kind: EntityKind, id: Uuid, expected: i64) -> Option<StoreError> {
        let mut fault = self.fault.lock().unwrap();
        match &mut *fault {
            Fault::Conflict {
                kind: k,
                id: i,
                remaining,
            } if *k == kind && *i == id && *remaining > 0 => {
                *remaining -= 1;
                Some(StoreError::VersionConflict {
                    kind,
                    id,
                    expected,
                    actual: expected + 1,
                })
            }
            Fault::Io { kind: k, id: i } if *k == kind && *i == id => {
                Some(StoreError::Io("injected write failure".to_string()))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl EntityStore for FaultyStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<VersionedRecord>, StoreError> {
        self.inner.get(kind, id).await
    }

    async fn put_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
        payload: serde_json::Value,
    ) -> Result<i64, StoreError> {
        if let Some(err) = self.intercept(kind, id, expected) {
            return Err(err);
        }
        self.inner.put_if_version(kind, id, expected, payload).await
    }

    async fn delete_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.intercept(kind, id, expected) {
            return Err(err);
        }
        self.inner.delete_if_version(kind, id, expected).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<VersionedRecord>, StoreError> {
        self.inner.list(kind).await
    }

    async fn find_by_field(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        self.inner.find_by_field(kind, field, value).await
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        self.inner.entries_for_account(account_id, limit, offset).await
    }
}

/// Oracle wrapper counting quote fetches.
struct CountingOracle {
    inner: FixedRateOracle,
    calls: AtomicU32,
}

impl CountingOracle {
    fn new(inner: FixedRateOracle) -> Self {
        Self {
            inner,
            calls: AtomicU32::new(0),
        }
    }

    fn quote_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for CountingOracle {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn crypto_quote(
        &self,
        symbol: &Symbol,
        currency: &Currency,
    ) -> Result<Quote, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.crypto_quote(symbol, currency).await
    }

    async fn fiat_rate(&self, base: &Currency, quote: &Currency) -> Result<Decimal, OracleError> {
        self.inner.fiat_rate(base, quote).await
    }
}

// =========================================================================
// Deposits and withdrawals
// =========================================================================

#[tokio::test]
async fn test_deposit_credits_account_and_records_entry() {
    let fx = fixture();
    let ctx = customer();
    let account = open_account(&fx, &ctx).await;

    let receipt = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Salary".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(receipt.operation, "deposit");
    assert!(!receipt.replayed);
    assert_eq!(receipt.entries.len(), 1);
    let entry = &receipt.entries[0];
    assert_eq!(entry.kind, EntryKind::Deposit);
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(entry.amount, aud(10_000));
    assert_eq!(entry.balance_after, aud(10_000));
    assert_eq!(entry.caller_id, ctx.caller_id);

    let stored = stored_account(fx.store.as_ref(), account.id).await;
    assert_eq!(stored.balance, aud(10_000));
}

#[tokio::test]
async fn test_withdrawal_rejects_overdraw() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 10_000).await;

    let err = fx
        .engine
        .withdraw(
            Withdrawal {
                account_id: account.id,
                amount: aud(10_001),
                description: "ATM".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    let stored = stored_account(fx.store.as_ref(), account.id).await;
    assert_eq!(stored.balance, aud(10_000));
    // Only the funding deposit was recorded
    assert_eq!(entries_of(fx.store.as_ref(), account.id).await.len(), 1);
}

#[tokio::test]
async fn test_withdrawal_of_exact_balance_drains_account() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 10_000).await;

    fx.engine
        .withdraw(
            Withdrawal {
                account_id: account.id,
                amount: aud(10_000),
                description: "Close out".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let stored = stored_account(fx.store.as_ref(), account.id).await;
    assert!(stored.balance.is_zero());
}

#[tokio::test]
async fn test_non_positive_amount_rejected_before_any_read() {
    let fx = fixture();
    let ctx = customer();

    // The account does not even exist; validation fires first
    let err = fx
        .engine
        .deposit(
            Deposit {
                account_id: Uuid::new_v4(),
                amount: aud(0),
                description: "Nothing".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
}

// =========================================================================
// Transfers
// =========================================================================

#[tokio::test]
async fn test_transfer_moves_funds_and_links_both_entries() {
    let fx = fixture();
    let ctx = customer();
    let from = funded_account(&fx, &ctx, 10_000).await;
    let to = open_account(&fx, &ctx).await;

    let receipt = fx
        .engine
        .transfer(
            Transfer {
                from_account_id: from.id,
                to_account_id: to.id,
                amount: aud(2_500),
                memo: "rent".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(receipt.entries.len(), 2);
    let out = &receipt.entries[0];
    let inn = &receipt.entries[1];
    assert_eq!(out.kind, EntryKind::TransferOut);
    assert_eq!(inn.kind, EntryKind::TransferIn);
    assert_eq!(out.amount, aud(-2_500));
    assert_eq!(inn.amount, aud(2_500));
    assert_eq!(out.correlation_id, inn.correlation_id);
    assert_eq!(out.description, "rent");

    assert_eq!(
        stored_account(fx.store.as_ref(), from.id).await.balance,
        aud(7_500)
    );
    assert_eq!(
        stored_account(fx.store.as_ref(), to.id).await.balance,
        aud(2_500)
    );
}

#[tokio::test]
async fn test_transfer_to_same_account_rejected() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 10_000).await;

    let err = fx
        .engine
        .transfer(
            Transfer {
                from_account_id: account.id,
                to_account_id: account.id,
                amount: aud(100),
                memo: "loop".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::SameAccount);
}

#[tokio::test]
async fn test_transfer_across_currencies_rejected() {
    let fx = fixture();
    let ctx = customer();
    let from = funded_account(&fx, &ctx, 10_000).await;
    let to = fx
        .engine
        .open_account(
            ctx.caller_id,
            AccountKind::Savings,
            OwnerType::Personal,
            "Dollars".to_string(),
            Currency::usd(),
            None,
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .transfer(
            Transfer {
                from_account_id: from.id,
                to_account_id: to.id,
                amount: aud(1_000),
                memo: "fx".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));

    // Neither side moved
    assert_eq!(
        stored_account(fx.store.as_ref(), from.id).await.balance,
        aud(10_000)
    );
    assert!(stored_account(fx.store.as_ref(), to.id).await.balance.is_zero());
}

// =========================================================================
// Crypto buys and sells
// =========================================================================

#[tokio::test]
async fn test_crypto_buy_opens_position_at_rate() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 100_000).await;

    let receipt = fx
        .engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: Some(aud(5_000_000)),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    // 0.01 x 50,000.00 = 500.00
    assert_eq!(receipt.entries.len(), 1);
    let entry = &receipt.entries[0];
    assert_eq!(entry.kind, EntryKind::CryptoBuy);
    assert_eq!(entry.amount, aud(-50_000));
    assert_eq!(entry.balance_after, aud(50_000));

    let position_id = CryptoPosition::position_id(account.id, &btc());
    let position: CryptoPosition = fx
        .store
        .get(EntityKind::Position, position_id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(position.quantity.value(), dec!(0.01));
    assert_eq!(position.avg_cost, aud(5_000_000));
}

#[tokio::test]
async fn test_crypto_buy_recomputes_weighted_average() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 200_000).await;

    let buy = |rate_set: i64| CryptoBuy {
        account_id: account.id,
        symbol: btc(),
        quantity: qty(dec!(0.01)),
        quoted_rate: Some(aud(rate_set)),
    };

    fx.engine
        .crypto_buy(buy(5_000_000), Uuid::new_v4(), &ctx)
        .await
        .unwrap();
    fx.oracle.set_crypto_rate(btc(), aud(6_000_000));
    fx.engine
        .crypto_buy(buy(6_000_000), Uuid::new_v4(), &ctx)
        .await
        .unwrap();

    let position_id = CryptoPosition::position_id(account.id, &btc());
    let position: CryptoPosition = fx
        .store
        .get(EntityKind::Position, position_id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(position.quantity.value(), dec!(0.02));
    // (0.01 x 5,000,000 + 0.01 x 6,000,000) / 0.02
    assert_eq!(position.avg_cost, aud(5_500_000));
}

#[tokio::test]
async fn test_crypto_sell_shrinks_then_deletes_position() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 100_000).await;
    fx.engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.02)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let sell = |q: Decimal| CryptoSell {
        account_id: account.id,
        symbol: btc(),
        quantity: qty(q),
    };
    let position_id = CryptoPosition::position_id(account.id, &btc());

    fx.engine
        .crypto_sell(sell(dec!(0.01)), Uuid::new_v4(), &ctx)
        .await
        .unwrap();
    let position: CryptoPosition = fx
        .store
        .get(EntityKind::Position, position_id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(position.quantity.value(), dec!(0.01));

    let receipt = fx
        .engine
        .crypto_sell(sell(dec!(0.01)), Uuid::new_v4(), &ctx)
        .await
        .unwrap();
    assert_eq!(receipt.entries[0].kind, EntryKind::CryptoSell);
    assert_eq!(receipt.entries[0].amount, aud(50_000));

    // Fully liquidated position is deleted, not stored at zero
    assert!(fx
        .store
        .get(EntityKind::Position, position_id)
        .await
        .unwrap()
        .is_none());
    // Bought and sold at the same rate; the fiat came back
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(100_000)
    );
}

#[tokio::test]
async fn test_crypto_sell_without_position_rejected() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 100_000).await;

    let err = fx
        .engine
        .crypto_sell(
            CryptoSell {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.5)),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    match err {
        LedgerError::InsufficientPosition { held, .. } => assert_eq!(held, Decimal::ZERO),
        other => panic!("expected InsufficientPosition, got {other:?}"),
    }
}

#[tokio::test]
async fn test_crypto_oversell_rejected() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 100_000).await;
    fx.engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .crypto_sell(
            CryptoSell {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.02)),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientPosition { .. }));
}

#[tokio::test]
async fn test_oracle_outage_fails_operation_then_key_can_be_retried() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 100_000).await;
    let key = Uuid::new_v4();
    let buy = CryptoBuy {
        account_id: account.id,
        symbol: btc(),
        quantity: qty(dec!(0.01)),
        quoted_rate: None,
    };

    fx.oracle.set_outage(true);
    let err = fx
        .engine
        .crypto_buy(buy.clone(), key, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::PriceUnavailable(_)));
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(100_000)
    );

    // A failed key is retaken on retry, not replayed
    fx.oracle.set_outage(false);
    let receipt = fx.engine.crypto_buy(buy, key, &ctx).await.unwrap();
    assert!(!receipt.replayed);
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(50_000)
    );
}

#[tokio::test]
async fn test_crypto_buy_on_missing_account_fails_early() {
    let fx = fixture();
    let ctx = customer();

    let err = fx
        .engine
        .crypto_buy(
            CryptoBuy {
                account_id: Uuid::new_v4(),
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::NotFound {
            entity: "Account",
            ..
        }
    ));
}

// =========================================================================
// Card charges and repayments
// =========================================================================

#[tokio::test]
async fn test_card_charge_within_limit() {
    let fx = fixture();
    let ctx = customer();
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Platinum".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();

    let receipt = fx
        .engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(30_000),
                merchant: "Grocer".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let entry = &receipt.entries[0];
    assert_eq!(entry.kind, EntryKind::CardCharge);
    assert_eq!(entry.amount, aud(30_000));
    assert_eq!(entry.balance_after, aud(30_000));

    let stored = stored_card(fx.store.as_ref(), card.id).await;
    assert_eq!(stored.balance, aud(30_000));
    assert_eq!(stored.available_credit(), aud(70_000));
}

#[tokio::test]
async fn test_card_charge_beyond_limit_rejected() {
    let fx = fixture();
    let ctx = customer();
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Standard".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();

    let err = fx
        .engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(150_000),
                merchant: "Jeweller".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::CreditLimitExceeded { .. }));
    assert!(stored_card(fx.store.as_ref(), card.id).await.balance.is_zero());
    assert!(entries_of(fx.store.as_ref(), card.id).await.is_empty());
}

#[tokio::test]
async fn test_card_repayment_moves_account_and_card_together() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 50_000).await;
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Platinum".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();
    fx.engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(30_000),
                merchant: "Grocer".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let receipt = fx
        .engine
        .card_repayment(
            CardRepayment {
                card_id: card.id,
                account_id: account.id,
                amount: aud(20_000),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(receipt.entries.len(), 2);
    let account_leg = &receipt.entries[0];
    let card_leg = &receipt.entries[1];
    assert_eq!(account_leg.kind, EntryKind::Withdrawal);
    assert_eq!(account_leg.amount, aud(-20_000));
    assert_eq!(card_leg.kind, EntryKind::CardRepayment);
    assert_eq!(card_leg.amount, aud(-20_000));
    assert_eq!(account_leg.correlation_id, card_leg.correlation_id);

    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(30_000)
    );
    assert_eq!(stored_card(fx.store.as_ref(), card.id).await.balance, aud(10_000));
}

#[tokio::test]
async fn test_over_repayment_rejected_without_partial_effect() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 50_000).await;
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Platinum".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();
    fx.engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(10_000),
                merchant: "Grocer".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .card_repayment(
            CardRepayment {
                card_id: card.id,
                account_id: account.id,
                amount: aud(15_000),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::OverRepayment { .. }));
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(50_000)
    );
    assert_eq!(stored_card(fx.store.as_ref(), card.id).await.balance, aud(10_000));
}

#[tokio::test]
async fn test_repayment_with_insufficient_funds_leaves_card_untouched() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 5_000).await;
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Platinum".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();
    fx.engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(30_000),
                merchant: "Grocer".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .card_repayment(
            CardRepayment {
                card_id: card.id,
                account_id: account.id,
                amount: aud(20_000),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert_eq!(stored_card(fx.store.as_ref(), card.id).await.balance, aud(30_000));
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(5_000)
    );
}

// =========================================================================
// Idempotency
// =========================================================================

#[tokio::test]
async fn test_duplicate_key_replays_receipt_without_reapplying() {
    let fx = fixture();
    let ctx = customer();
    let account = open_account(&fx, &ctx).await;
    let key = Uuid::new_v4();
    let deposit = Deposit {
        account_id: account.id,
        amount: aud(10_000),
        description: "Salary".to_string(),
    };

    let first = fx
        .engine
        .deposit(deposit.clone(), key, &ctx)
        .await
        .unwrap();
    let second = fx.engine.deposit(deposit, key, &ctx).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.entries, second.entries);
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(10_000)
    );
}

#[tokio::test]
async fn test_key_reuse_with_different_request_conflicts() {
    let fx = fixture();
    let ctx = customer();
    let account = open_account(&fx, &ctx).await;
    let key = Uuid::new_v4();

    fx.engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Salary".to_string(),
            },
            key,
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(20_000),
                description: "Salary".to_string(),
            },
            key,
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(10_000)
    );
}

// =========================================================================
// Reversals
// =========================================================================

#[tokio::test]
async fn test_reversal_restores_balance_and_flips_original() {
    let fx = fixture();
    let ctx = customer();
    let account = open_account(&fx, &ctx).await;
    let receipt = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Mistaken credit".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();
    let original = &receipt.entries[0];

    let ops = operator();
    let reversal = fx
        .engine
        .reverse_entry(
            ReverseEntry {
                entry_id: original.id,
            },
            Uuid::new_v4(),
            &ops,
        )
        .await
        .unwrap();

    let entry = &reversal.entries[0];
    assert_eq!(entry.kind, EntryKind::Reversal);
    assert_eq!(entry.amount, aud(-10_000));
    assert_eq!(entry.correlation_id, original.correlation_id);

    assert!(stored_account(fx.store.as_ref(), account.id).await.balance.is_zero());

    let entries = entries_of(fx.store.as_ref(), account.id).await;
    let flipped = entries.iter().find(|e| e.id == original.id).unwrap();
    assert_eq!(flipped.status, EntryStatus::Reversed);
    assert_eq!(flipped.amount, aud(10_000));
    // Replay still reproduces the stored balance
    assert_eq!(replayed_minor(&entries), 0);
}

#[tokio::test]
async fn test_reversal_requires_operator_role() {
    let fx = fixture();
    let ctx = customer();
    let account = open_account(&fx, &ctx).await;
    let receipt = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Salary".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .reverse_entry(
            ReverseEntry {
                entry_id: receipt.entries[0].id,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unauthorized(_)));
}

#[tokio::test]
async fn test_reversing_twice_rejected() {
    let fx = fixture();
    let ctx = customer();
    let ops = operator();
    let account = open_account(&fx, &ctx).await;
    let receipt = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Salary".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();
    let target = ReverseEntry {
        entry_id: receipt.entries[0].id,
    };

    fx.engine
        .reverse_entry(target.clone(), Uuid::new_v4(), &ops)
        .await
        .unwrap();
    let err = fx
        .engine
        .reverse_entry(target, Uuid::new_v4(), &ops)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
}

#[tokio::test]
async fn test_crypto_entries_cannot_be_reversed() {
    let fx = fixture();
    let ctx = customer();
    let ops = operator();
    let account = funded_account(&fx, &ctx, 100_000).await;
    let receipt = fx
        .engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let err = fx
        .engine
        .reverse_entry(
            ReverseEntry {
                entry_id: receipt.entries[0].id,
            },
            Uuid::new_v4(),
            &ops,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
}

#[tokio::test]
async fn test_card_charge_reversal_repays_card() {
    let fx = fixture();
    let ctx = customer();
    let ops = operator();
    let card = fx
        .engine
        .issue_card(ctx.caller_id, "Platinum".to_string(), aud(100_000), &ctx)
        .await
        .unwrap();
    let receipt = fx
        .engine
        .card_charge(
            CardCharge {
                card_id: card.id,
                amount: aud(30_000),
                merchant: "Disputed merchant".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    fx.engine
        .reverse_entry(
            ReverseEntry {
                entry_id: receipt.entries[0].id,
            },
            Uuid::new_v4(),
            &ops,
        )
        .await
        .unwrap();

    let stored = stored_card(fx.store.as_ref(), card.id).await;
    assert!(stored.balance.is_zero());
    let entries = entries_of(fx.store.as_ref(), card.id).await;
    assert_eq!(replayed_minor(&entries), 0);
}

// =========================================================================
// Cancellation
// =========================================================================

#[tokio::test]
async fn test_cancelled_context_stops_before_any_write() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 10_000).await;

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = ctx.clone().with_cancellation(token);

    let err = fx
        .engine
        .withdraw(
            Withdrawal {
                account_id: account.id,
                amount: aud(1_000),
                description: "Abandoned".to_string(),
            },
            Uuid::new_v4(),
            &cancelled,
        )
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::Cancelled);
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(10_000)
    );
}

// =========================================================================
// Concurrency and failure outcomes
// =========================================================================

#[tokio::test]
async fn test_concurrent_withdrawals_exactly_one_wins() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 10_000).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = fx.engine.clone();
        let ctx = customer();
        let account_id = account.id;
        handles.push(tokio::spawn(async move {
            engine
                .withdraw(
                    Withdrawal {
                        account_id,
                        amount: aud(6_000),
                        description: "Race".to_string(),
                    },
                    Uuid::new_v4(),
                    &ctx,
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(
        stored_account(fx.store.as_ref(), account.id).await.balance,
        aud(4_000)
    );
    let withdrawals = entries_of(fx.store.as_ref(), account.id)
        .await
        .iter()
        .filter(|e| e.kind == EntryKind::Withdrawal && e.status == EntryStatus::Completed)
        .count();
    assert_eq!(withdrawals, 1);
}

#[tokio::test]
async fn test_persistent_conflict_on_first_leg_is_contention() {
    let store = Arc::new(FaultyStore::new());
    let oracle = Arc::new(FixedRateOracle::default());
    let engine = LedgerEngine::new(store.clone(), oracle).with_retry(RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 1,
    });
    let ctx = customer();
    let account = engine
        .open_account(
            ctx.caller_id,
            AccountKind::Checking,
            OwnerType::Personal,
            "Everyday".to_string(),
            Currency::aud(),
            None,
            &ctx,
        )
        .await
        .unwrap();
    engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(10_000),
                description: "Seed".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    store.conflict_on(EntityKind::Account, account.id, u32::MAX);
    let err = engine
        .withdraw(
            Withdrawal {
                account_id: account.id,
                amount: aud(1_000),
                description: "Starved".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    // Nothing was ever applied, so the outcome is pure contention
    assert_eq!(err, LedgerError::Contention { attempts: 3 });
    assert_eq!(
        stored_account(store.as_ref(), account.id).await.balance,
        aud(10_000)
    );
    let entries = entries_of(store.as_ref(), account.id).await;
    assert!(entries.iter().all(|e| e.status == EntryStatus::Completed));
}

#[tokio::test]
async fn test_persistent_conflict_on_second_leg_recovers_with_audit() {
    let store = Arc::new(FaultyStore::new());
    let oracle = Arc::new(FixedRateOracle::default());
    let engine = LedgerEngine::new(store.clone(), oracle).with_retry(RetryPolicy {
        max_attempts: 2,
        backoff_base_ms: 1,
    });
    let ctx = customer();
    let open = |name: &str| {
        engine.open_account(
            ctx.caller_id,
            AccountKind::Checking,
            OwnerType::Personal,
            name.to_string(),
            Currency::aud(),
            None,
            &ctx,
        )
    };
    let from = open("From").await.unwrap();
    let to = open("To").await.unwrap();
    engine
        .deposit(
            Deposit {
                account_id: from.id,
                amount: aud(10_000),
                description: "Seed".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    // The debit leg applies, the credit leg always conflicts
    store.conflict_on(EntityKind::Account, to.id, u32::MAX);
    let err = engine
        .transfer(
            Transfer {
                from_account_id: from.id,
                to_account_id: to.id,
                amount: aud(2_500),
                memo: "Doomed".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::PartialFailureRecovered(_)));
    // The applied debit was compensated
    assert_eq!(
        stored_account(store.as_ref(), from.id).await.balance,
        aud(10_000)
    );

    // The attempt left an audit trail that replay ignores
    let from_entries = entries_of(store.as_ref(), from.id).await;
    assert!(from_entries
        .iter()
        .any(|e| e.kind == EntryKind::TransferOut && e.status == EntryStatus::Failed));
    assert_eq!(replayed_minor(&from_entries), 10_000);
}

#[tokio::test]
async fn test_io_failure_mid_plan_compensates_without_retry() {
    let store = Arc::new(FaultyStore::new());
    let oracle = Arc::new(FixedRateOracle::default());
    let engine = LedgerEngine::new(store.clone(), oracle);
    let ctx = customer();
    let open = |name: &str| {
        engine.open_account(
            ctx.caller_id,
            AccountKind::Checking,
            OwnerType::Personal,
            name.to_string(),
            Currency::aud(),
            None,
            &ctx,
        )
    };
    let from = open("From").await.unwrap();
    let to = open("To").await.unwrap();
    engine
        .deposit(
            Deposit {
                account_id: from.id,
                amount: aud(10_000),
                description: "Seed".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    store.io_on(EntityKind::Account, to.id);
    let err = engine
        .transfer(
            Transfer {
                from_account_id: from.id,
                to_account_id: to.id,
                amount: aud(2_500),
                memo: "Broken rail".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::PartialFailureRecovered(_)));
    assert_eq!(
        stored_account(store.as_ref(), from.id).await.balance,
        aud(10_000)
    );
}

#[tokio::test]
async fn test_quote_fetched_once_across_retries() {
    let store = Arc::new(FaultyStore::new());
    let fixed = FixedRateOracle::default();
    fixed.set_crypto_rate(btc(), aud(5_000_000));
    let oracle = Arc::new(CountingOracle::new(fixed));
    let engine = LedgerEngine::new(store.clone(), oracle.clone()).with_retry(RetryPolicy {
        max_attempts: 5,
        backoff_base_ms: 1,
    });
    let ctx = customer();
    let account = engine
        .open_account(
            ctx.caller_id,
            AccountKind::Checking,
            OwnerType::Personal,
            "Trading".to_string(),
            Currency::aud(),
            None,
            &ctx,
        )
        .await
        .unwrap();
    engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(100_000),
                description: "Seed".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    // First two attempts lose the account CAS, the third lands
    store.conflict_on(EntityKind::Account, account.id, 2);
    let receipt = engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(receipt.entries[0].amount, aud(-50_000));
    assert_eq!(oracle.quote_calls(), 1);
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn test_close_account_requires_zero_balance_and_no_positions() {
    let fx = fixture();
    let ctx = customer();
    let account = funded_account(&fx, &ctx, 50_000).await;

    // Funds remain
    assert!(matches!(
        fx.engine.close_account(account.id, &ctx).await,
        Err(LedgerError::Validation(_))
    ));

    // The buy costs exactly the balance: drained, but a position is open
    fx.engine
        .crypto_buy(
            CryptoBuy {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
                quoted_rate: None,
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();
    assert!(stored_account(fx.store.as_ref(), account.id)
        .await
        .balance
        .is_zero());
    assert!(matches!(
        fx.engine.close_account(account.id, &ctx).await,
        Err(LedgerError::Validation(_))
    ));

    // Liquidate, drain the proceeds, then close
    fx.engine
        .crypto_sell(
            CryptoSell {
                account_id: account.id,
                symbol: btc(),
                quantity: qty(dec!(0.01)),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();
    fx.engine
        .withdraw(
            Withdrawal {
                account_id: account.id,
                amount: aud(50_000),
                description: "Final drain".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap();

    let closed = fx.engine.close_account(account.id, &ctx).await.unwrap();
    assert_eq!(closed.status, crate::domain::AccountStatus::Closed);

    // A closed account takes no further operations
    let err = fx
        .engine
        .deposit(
            Deposit {
                account_id: account.id,
                amount: aud(100),
                description: "Too late".to_string(),
            },
            Uuid::new_v4(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Closed { .. }));
}
