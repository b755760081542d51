//! Read-side queries.
//!
//! Computed from current store state at call time; nothing here is stored
//! or cached between calls. Valuations consult the oracle and fail with
//! `PriceUnavailable` rather than serving a stale number.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Account, CreditCard, CryptoPosition, Currency, LedgerEntry, LedgerError, Money, MoneyError,
    Quantity, Symbol,
};
use crate::oracle::PriceOracle;
use crate::store::{EntityKind, EntityStore};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Page bounds for entry listings.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.max(0),
        }
    }
}

/// One account's contribution to a valuation.
#[derive(Debug, Clone, Serialize)]
pub struct AccountLine {
    pub account_id: Uuid,
    pub display_name: String,
    /// Balance in the account's own currency.
    pub balance: Money,
    /// The balance converted to the valuation currency.
    pub value: Money,
}

/// One position's contribution to a valuation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionLine {
    pub account_id: Uuid,
    pub symbol: Symbol,
    pub quantity: Quantity,
    /// Spot rate used, in the account's currency per whole unit.
    pub rate: Money,
    /// `quantity x rate`, converted to the valuation currency.
    pub market_value: Money,
}

/// A portfolio snapshot priced at call time.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioValuation {
    pub owner_id: Uuid,
    pub currency: Currency,
    pub accounts: Vec<AccountLine>,
    pub positions: Vec<PositionLine>,
    pub total: Money,
    pub valued_at: DateTime<Utc>,
}

/// Read-only facade over the entity store.
pub struct QueryService {
    store: Arc<dyn EntityStore>,
    oracle: Arc<dyn PriceOracle>,
}

impl QueryService {
    pub fn new(store: Arc<dyn EntityStore>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self { store, oracle }
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        let record = self
            .store
            .get(EntityKind::Account, id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Account", id))?;
        Ok(record.decode()?)
    }

    pub async fn get_card(&self, id: Uuid) -> Result<CreditCard, LedgerError> {
        let record = self
            .store
            .get(EntityKind::Card, id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Card", id))?;
        Ok(record.decode()?)
    }

    /// All accounts belonging to an owner, closed ones included.
    pub async fn list_accounts_for_owner(&self, owner_id: Uuid) -> Result<Vec<Account>, LedgerError> {
        let records = self
            .store
            .find_by_field(EntityKind::Account, "owner_id", &owner_id.to_string())
            .await?;
        records
            .iter()
            .map(|r| r.decode().map_err(LedgerError::from))
            .collect()
    }

    /// Ledger entries for an account, newest first.
    pub async fn list_entries(
        &self,
        account_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        // Distinguish an empty history from a nonexistent account
        self.get_account(account_id).await?;
        let page = page.clamped();
        let records = self
            .store
            .entries_for_account(account_id, page.limit, page.offset)
            .await?;
        records
            .iter()
            .map(|r| r.decode().map_err(LedgerError::from))
            .collect()
    }

    /// Value an owner's holdings in one currency. Fiat balances convert at
    /// the oracle's cross rate; positions are priced `quantity x rate` in
    /// their account's currency first, then converted.
    pub async fn portfolio_valuation(
        &self,
        owner_id: Uuid,
        currency: Currency,
    ) -> Result<PortfolioValuation, LedgerError> {
        let accounts = self.list_accounts_for_owner(owner_id).await?;

        // One fiat rate per source currency per call
        let mut fiat_rates: HashMap<Currency, Decimal> = HashMap::new();

        let mut account_lines = Vec::with_capacity(accounts.len());
        let mut position_lines = Vec::new();
        let mut total = Money::zero(currency.clone());

        for account in &accounts {
            let rate = self
                .fiat_rate_memo(&mut fiat_rates, &account.currency, &currency)
                .await?;
            let value = convert(&account.balance, &currency, rate)?;
            total = total.checked_add(&value)?;
            account_lines.push(AccountLine {
                account_id: account.id,
                display_name: account.display_name.clone(),
                balance: account.balance.clone(),
                value,
            });

            for record in self
                .store
                .find_by_field(EntityKind::Position, "account_id", &account.id.to_string())
                .await?
            {
                let position: CryptoPosition = record.decode()?;
                let quote = self
                    .oracle
                    .crypto_quote(&position.symbol, &account.currency)
                    .await?;
                let native = quote.rate.scaled(position.quantity.value())?;
                let market_value = convert(&native, &currency, rate)?;
                total = total.checked_add(&market_value)?;
                position_lines.push(PositionLine {
                    account_id: account.id,
                    symbol: position.symbol,
                    quantity: position.quantity,
                    rate: quote.rate,
                    market_value,
                });
            }
        }

        tracing::debug!(
            owner = %owner_id,
            currency = %currency,
            accounts = account_lines.len(),
            positions = position_lines.len(),
            total = %total,
            "portfolio valued"
        );

        Ok(PortfolioValuation {
            owner_id,
            currency,
            accounts: account_lines,
            positions: position_lines,
            total,
            valued_at: Utc::now(),
        })
    }

    async fn fiat_rate_memo(
        &self,
        memo: &mut HashMap<Currency, Decimal>,
        base: &Currency,
        quote: &Currency,
    ) -> Result<Decimal, LedgerError> {
        // Identity conversion never consults the oracle
        if base == quote {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = memo.get(base) {
            return Ok(*rate);
        }
        let rate = self.oracle.fiat_rate(base, quote).await?;
        memo.insert(base.clone(), rate);
        Ok(rate)
    }
}

/// Convert an amount into `to` at a decimal cross rate, rounding half away
/// from zero to the target currency's minor unit.
fn convert(amount: &Money, to: &Currency, rate: Decimal) -> Result<Money, LedgerError> {
    let major = amount
        .to_decimal()
        .checked_mul(rate)
        .ok_or(MoneyError::Overflow)?
        .round_dp_with_strategy(to.decimal_places(), RoundingStrategy::MidpointAwayFromZero);
    Ok(Money::from_decimal(major, to.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountKind, CryptoPosition, EntryKind, EntryStatus, OwnerType};
    use crate::oracle::FixedRateOracle;
    use crate::store::{encode, MemoryStore};
    use rust_decimal_macros::dec;

    fn aud(minor: i64) -> Money {
        Money::new(minor, Currency::aud())
    }

    fn btc() -> Symbol {
        Symbol::new("BTC").unwrap()
    }

    fn service() -> (QueryService, Arc<MemoryStore>, Arc<FixedRateOracle>) {
        let store = Arc::new(MemoryStore::new());
        let oracle = Arc::new(FixedRateOracle::default());
        let service = QueryService::new(store.clone(), oracle.clone());
        (service, store, oracle)
    }

    async fn seed_account(
        store: &MemoryStore,
        owner_id: Uuid,
        currency: Currency,
        minor: i64,
    ) -> Account {
        let mut account = Account::open(
            Uuid::new_v4(),
            owner_id,
            AccountKind::Checking,
            OwnerType::Personal,
            "Seeded".to_string(),
            currency.clone(),
            None,
        )
        .unwrap();
        account.balance = Money::new(minor, currency);
        store
            .put_if_version(EntityKind::Account, account.id, 0, encode(&account).unwrap())
            .await
            .unwrap();
        account
    }

    async fn seed_entry(store: &MemoryStore, account_id: Uuid, version: i64, minor: i64) {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            kind: EntryKind::Deposit,
            status: EntryStatus::Completed,
            amount: aud(minor),
            balance_after: aud(minor),
            account_version: version,
            description: format!("seed {version}"),
            correlation_id: Uuid::new_v4(),
            idempotency_key: None,
            caller_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        store
            .put_if_version(EntityKind::Entry, entry.id, 0, encode(&entry).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_account_not_found() {
        let (service, _, _) = service();
        let err = service.get_account(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "Account", .. }));
    }

    #[tokio::test]
    async fn test_list_accounts_filters_by_owner() {
        let (service, store, _) = service();
        let owner = Uuid::new_v4();
        seed_account(&store, owner, Currency::aud(), 100).await;
        seed_account(&store, owner, Currency::aud(), 200).await;
        seed_account(&store, Uuid::new_v4(), Currency::aud(), 300).await;

        let accounts = service.list_accounts_for_owner(owner).await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts.iter().all(|a| a.owner_id == owner));
    }

    #[tokio::test]
    async fn test_list_entries_newest_first_with_paging() {
        let (service, store, _) = service();
        let account = seed_account(&store, Uuid::new_v4(), Currency::aud(), 0).await;
        for version in 1..=5 {
            seed_entry(&store, account.id, version, version * 100).await;
        }

        let page = service
            .list_entries(account.id, Pagination { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].account_version, 5);
        assert_eq!(page[1].account_version, 4);

        let next = service
            .list_entries(account.id, Pagination { limit: 2, offset: 2 })
            .await
            .unwrap();
        assert_eq!(next[0].account_version, 3);

        let err = service
            .list_entries(Uuid::new_v4(), Pagination::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_pagination_clamps() {
        let page = Pagination {
            limit: 0,
            offset: -5,
        }
        .clamped();
        assert_eq!(page.limit, 1);
        assert_eq!(page.offset, 0);

        let page = Pagination {
            limit: 10_000,
            offset: 3,
        }
        .clamped();
        assert_eq!(page.limit, MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_portfolio_sums_accounts_and_positions() {
        let (service, store, oracle) = service();
        let owner = Uuid::new_v4();
        seed_account(&store, owner, Currency::aud(), 10_000).await;
        let trading = seed_account(&store, owner, Currency::aud(), 5_000).await;
        let foreign = seed_account(&store, owner, Currency::usd(), 1_000).await;

        let position = CryptoPosition::opened(
            trading.id,
            btc(),
            Quantity::new(dec!(0.5)).unwrap(),
            &aud(4_000_000),
        );
        store
            .put_if_version(
                EntityKind::Position,
                position.id(),
                0,
                encode(&position).unwrap(),
            )
            .await
            .unwrap();

        oracle.set_crypto_rate(btc(), aud(5_000_000));
        oracle.set_fiat_rate(Currency::usd(), Currency::aud(), dec!(1.5));

        let valuation = service
            .portfolio_valuation(owner, Currency::aud())
            .await
            .unwrap();

        assert_eq!(valuation.accounts.len(), 3);
        assert_eq!(valuation.positions.len(), 1);
        // 0.5 BTC at 50,000.00
        assert_eq!(valuation.positions[0].market_value, aud(2_500_000));
        let usd_line = valuation
            .accounts
            .iter()
            .find(|l| l.account_id == foreign.id)
            .unwrap();
        assert_eq!(usd_line.value, aud(1_500));
        // 100.00 + 50.00 + 15.00 + 25,000.00
        assert_eq!(valuation.total, aud(10_000 + 5_000 + 1_500 + 2_500_000));
    }

    #[tokio::test]
    async fn test_portfolio_fails_closed_when_oracle_down() {
        let (service, store, oracle) = service();
        let owner = Uuid::new_v4();
        let trading = seed_account(&store, owner, Currency::aud(), 5_000).await;
        let position = CryptoPosition::opened(
            trading.id,
            btc(),
            Quantity::new(dec!(0.1)).unwrap(),
            &aud(4_000_000),
        );
        store
            .put_if_version(
                EntityKind::Position,
                position.id(),
                0,
                encode(&position).unwrap(),
            )
            .await
            .unwrap();

        oracle.set_crypto_rate(btc(), aud(5_000_000));
        oracle.set_outage(true);

        let err = service
            .portfolio_valuation(owner, Currency::aud())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PriceUnavailable(_)));
    }
}
