//! Domain module
//!
//! Core domain types and business logic.

pub mod account;
pub mod card;
pub mod context;
pub mod entry;
pub mod error;
pub mod money;
pub mod position;

pub use account::{Account, AccountKind, AccountStatus, OwnerType, Routing};
pub use card::CreditCard;
pub use context::{OperationContext, Role};
pub use entry::{EntryKind, EntryStatus, LedgerEntry};
pub use error::LedgerError;
pub use money::{Currency, Money, MoneyError, Quantity, Symbol};
pub use position::CryptoPosition;
