//! Price oracle.
//!
//! Read-only source of crypto spot quotes and fiat cross rates. The engine
//! consults it exactly once per operation: a quote is fetched before the
//! first attempt and reused across retries of that operation, never across
//! operations. When no price is available the operation fails; a stale rate
//! is never substituted silently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::{Currency, LedgerError, Money, Symbol};

/// Errors from the price oracle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("rate source unavailable: {0}")]
    Unavailable(String),

    #[error("no quote for {symbol} in {currency}")]
    UnsupportedAsset { symbol: Symbol, currency: Currency },

    #[error("no cross rate for {base}/{quote}")]
    UnsupportedPair { base: Currency, quote: Currency },
}

impl From<OracleError> for LedgerError {
    fn from(err: OracleError) -> Self {
        LedgerError::PriceUnavailable(err.to_string())
    }
}

/// A spot quote for one whole unit of an asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: Symbol,
    /// Price of one whole unit, in fiat minor units.
    pub rate: Money,
    pub quoted_at: DateTime<Utc>,
    pub source: String,
}

/// Trait for price sources.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Get the oracle name.
    fn name(&self) -> &str;

    /// Spot quote for one unit of `symbol`, priced in `currency`.
    async fn crypto_quote(
        &self,
        symbol: &Symbol,
        currency: &Currency,
    ) -> Result<Quote, OracleError>;

    /// Multiplier converting an amount in `base` into `quote`.
    async fn fiat_rate(&self, base: &Currency, quote: &Currency) -> Result<Decimal, OracleError>;
}

/// Table-driven oracle.
///
/// Serves rates from in-memory tables seeded at startup or by tests. Also
/// the production fallback when no external feed is configured. An outage
/// can be simulated for failure-path tests.
pub struct FixedRateOracle {
    name: String,
    crypto: DashMap<(Symbol, Currency), i64>,
    fiat: DashMap<(Currency, Currency), Decimal>,
    outage: AtomicBool,
}

impl FixedRateOracle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            crypto: DashMap::new(),
            fiat: DashMap::new(),
            outage: AtomicBool::new(false),
        }
    }

    /// Set the spot price of one whole unit of `symbol`.
    pub fn set_crypto_rate(&self, symbol: Symbol, rate: Money) {
        self.crypto
            .insert((symbol, rate.currency.clone()), rate.minor);
    }

    pub fn set_fiat_rate(&self, base: Currency, quote: Currency, rate: Decimal) {
        self.fiat.insert((base, quote), rate);
    }

    /// Make every lookup fail until switched back.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn ensure_up(&self) -> Result<(), OracleError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable(format!(
                "{} oracle is down",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for FixedRateOracle {
    fn default() -> Self {
        Self::new("fixed")
    }
}

#[async_trait]
impl PriceOracle for FixedRateOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn crypto_quote(
        &self,
        symbol: &Symbol,
        currency: &Currency,
    ) -> Result<Quote, OracleError> {
        self.ensure_up()?;
        let minor = self
            .crypto
            .get(&(symbol.clone(), currency.clone()))
            .map(|r| *r)
            .ok_or_else(|| OracleError::UnsupportedAsset {
                symbol: symbol.clone(),
                currency: currency.clone(),
            })?;
        tracing::debug!(symbol = %symbol, currency = %currency, rate = minor, "served crypto quote");
        Ok(Quote {
            symbol: symbol.clone(),
            rate: Money::new(minor, currency.clone()),
            quoted_at: Utc::now(),
            source: self.name.clone(),
        })
    }

    async fn fiat_rate(&self, base: &Currency, quote: &Currency) -> Result<Decimal, OracleError> {
        self.ensure_up()?;
        if base == quote {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.fiat.get(&(base.clone(), quote.clone())) {
            return Ok(*rate);
        }
        // Fall back to the inverse pair when only one direction is seeded
        if let Some(rate) = self.fiat.get(&(quote.clone(), base.clone())) {
            if !rate.is_zero() {
                return Ok(Decimal::ONE / *rate);
            }
        }
        Err(OracleError::UnsupportedPair {
            base: base.clone(),
            quote: quote.clone(),
        })
    }
}
