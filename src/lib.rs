//! ledger-core Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod jobs;
pub mod oracle;
pub mod query;
pub mod store;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use domain::{Currency, LedgerError, Money, OperationContext, Quantity, Role, Symbol};
pub use engine::{LedgerEngine, OperationReceipt, RetryPolicy};
