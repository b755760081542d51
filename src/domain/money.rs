//! Monetary primitives.
//!
//! Fiat amounts are integer minor units paired with a currency code; crypto
//! quantities are fixed-precision decimals. All values are validated at
//! construction time so invalid amounts cannot exist in the system. Binary
//! floating point is never used on a money path.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum decimal places for a crypto quantity.
const MAX_QUANTITY_SCALE: u32 = 8;

/// Errors produced by monetary construction and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    #[error("amount overflows the representable range")]
    Overflow,

    #[error("amount must be positive (got {0})")]
    NotPositive(Decimal),

    #[error("too many decimal places (max {max}, got {got})")]
    TooManyDecimals { max: u32, got: u32 },

    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),

    #[error("invalid asset symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("invalid amount format: {0}")]
    Parse(String),
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Create a currency from a code. Codes are three ASCII letters,
    /// stored uppercase.
    pub fn new(code: &str) -> Result<Self, MoneyError> {
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Scale factor between minor and major units (10^decimal_places).
    pub fn minor_per_major(&self) -> i64 {
        10_i64.pow(self.decimal_places())
    }

    pub fn aud() -> Self {
        Self("AUD".to_string())
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn jpy() -> Self {
        Self("JPY".to_string())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.0
    }
}

/// A fiat amount in integer minor units (cents, yen, fils).
///
/// Arithmetic is explicit and checked: adding or subtracting across
/// currencies fails with `CurrencyMismatch`, and overflow never wraps.
/// The sign carries meaning only to the engine; balances are kept
/// non-negative by operation preconditions, not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub minor: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(minor: i64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    /// Parse a major-unit decimal string ("25.00") into minor units,
    /// honoring the currency's decimal places.
    pub fn parse(value: &str, currency: Currency) -> Result<Self, MoneyError> {
        let decimal =
            Decimal::from_str(value).map_err(|e| MoneyError::Parse(e.to_string()))?;
        Self::from_decimal(decimal, currency)
    }

    /// Convert a major-unit decimal into minor units. Fails when the value
    /// carries more fractional digits than the currency allows.
    pub fn from_decimal(value: Decimal, currency: Currency) -> Result<Self, MoneyError> {
        let places = currency.decimal_places();
        if value.normalize().scale() > places {
            return Err(MoneyError::TooManyDecimals {
                max: places,
                got: value.normalize().scale(),
            });
        }
        let scaled = value
            .checked_mul(Decimal::from(currency.minor_per_major()))
            .ok_or(MoneyError::Overflow)?;
        let minor = scaled.to_i64().ok_or(MoneyError::Overflow)?;
        Ok(Self { minor, currency })
    }

    /// The amount in major units as an exact decimal.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.minor, self.currency.decimal_places())
    }

    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    pub fn is_negative(&self) -> bool {
        self.minor < 0
    }

    /// The same amount with its sign flipped.
    pub fn negated(&self) -> Money {
        Money::new(-self.minor, self.currency.clone())
    }

    /// The magnitude of the amount.
    pub fn abs(&self) -> Money {
        Money::new(self.minor.abs(), self.currency.clone())
    }

    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency.clone()))
    }

    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.require_same_currency(other)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency.clone()))
    }

    /// Scale this amount by a decimal factor, rounding half away from zero
    /// to whole minor units. Used to price a crypto quantity against a
    /// per-unit rate.
    pub fn scaled(&self, factor: Decimal) -> Result<Money, MoneyError> {
        let minor = Decimal::from(self.minor)
            .checked_mul(factor)
            .ok_or(MoneyError::Overflow)?
            .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(minor, self.currency.clone()))
    }

    /// Fail unless `other` is denominated in the same currency.
    pub fn require_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}

/// A crypto asset quantity.
///
/// # Invariants
/// - Value is always positive (> 0)
/// - Maximum 8 decimal places
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity(Decimal);

impl Quantity {
    pub fn new(value: Decimal) -> Result<Self, MoneyError> {
        if value <= Decimal::ZERO {
            return Err(MoneyError::NotPositive(value));
        }
        if value.normalize().scale() > MAX_QUANTITY_SCALE {
            return Err(MoneyError::TooManyDecimals {
                max: MAX_QUANTITY_SCALE,
                got: value.normalize().scale(),
            });
        }
        Ok(Self(value.normalize()))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quantity {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s).map_err(|e| MoneyError::Parse(e.to_string()))?;
        Quantity::new(decimal)
    }
}

impl TryFrom<String> for Quantity {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.0.to_string()
    }
}

/// A crypto asset ticker ("BTC", "ETH"). Uppercase, 2 to 12 ASCII
/// alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(ticker: &str) -> Result<Self, MoneyError> {
        let ok = (2..=12).contains(&ticker.len())
            && ticker.chars().all(|c| c.is_ascii_alphanumeric());
        if !ok {
            return Err(MoneyError::InvalidSymbol(ticker.to_string()));
        }
        Ok(Self(ticker.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::new(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.0
    }
}
