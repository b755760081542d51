//! Entity store.
//!
//! Versioned current-state records with per-record compare-and-swap. Every
//! record carries a monotonically increasing version counter; writers name
//! the version they read and lose cleanly when someone got there first.
//! There are no multi-record transactions: atomicity across records is the
//! engine's job, built from these primitives plus compensation.

mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Namespace a record lives in. Kinds share one keyspace shape but never
/// collide with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Account,
    Card,
    Position,
    Entry,
    Idempotency,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Card => "card",
            EntityKind::Position => "position",
            EntityKind::Entry => "entry",
            EntityKind::Idempotency => "idempotency",
        }
    }

    /// Human-facing entity name for error messages.
    pub fn entity_name(&self) -> &'static str {
        match self {
            EntityKind::Account => "Account",
            EntityKind::Card => "Card",
            EntityKind::Position => "Position",
            EntityKind::Entry => "Entry",
            EntityKind::Idempotency => "Idempotency record",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored record with its version.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    pub kind: EntityKind,
    pub id: Uuid,
    pub version: i64,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl VersionedRecord {
    /// Decode the payload into a typed entity.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Serialize an entity into a store payload.
pub fn encode<T: Serialize>(entity: &T) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(entity)?)
}

/// Versioned record storage.
///
/// `expected_version = 0` means the record must not exist yet; a successful
/// first write lands at version 1. Conditional writes fail with
/// `StoreError::VersionConflict` carrying the version actually found (0
/// when the record is absent).
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch one record.
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<VersionedRecord>, StoreError>;

    /// Write a record iff its current version matches `expected`.
    /// Returns the new version.
    async fn put_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
        payload: serde_json::Value,
    ) -> Result<i64, StoreError>;

    /// Delete a record iff its current version matches `expected`.
    async fn delete_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
    ) -> Result<(), StoreError>;

    /// All records of a kind. Unordered beyond a stable id sort.
    async fn list(&self, kind: EntityKind) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Records of a kind whose payload field equals `value` (string
    /// comparison on the JSON field).
    async fn find_by_field(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Ledger entries touching an account, newest account version first.
    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VersionedRecord>, StoreError>;
}
