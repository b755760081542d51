//! In-memory entity store.
//!
//! DashMap-backed implementation used by tests, the load generator, and
//! deployments without a database. The map's per-shard entry lock makes
//! each conditional write atomic for its key, which is all the CAS
//! contract requires.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{EntityKind, EntityStore, StoreError, VersionedRecord};

#[derive(Debug, Clone)]
struct StoredRow {
    version: i64,
    payload: serde_json::Value,
    updated_at: chrono::DateTime<Utc>,
}

/// DashMap-backed store keyed by (kind, id).
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<(EntityKind, Uuid), StoredRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(kind: EntityKind, id: Uuid, row: &StoredRow) -> VersionedRecord {
        VersionedRecord {
            kind,
            id,
            version: row.version,
            payload: row.payload.clone(),
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self
            .rows
            .get(&(kind, id))
            .map(|row| Self::record(kind, id, &row)))
    }

    async fn put_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
        payload: serde_json::Value,
    ) -> Result<i64, StoreError> {
        match self.rows.entry((kind, id)) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().version;
                if actual != expected {
                    return Err(StoreError::VersionConflict {
                        kind,
                        id,
                        expected,
                        actual,
                    });
                }
                let version = expected + 1;
                occupied.insert(StoredRow {
                    version,
                    payload,
                    updated_at: Utc::now(),
                });
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected != 0 {
                    return Err(StoreError::VersionConflict {
                        kind,
                        id,
                        expected,
                        actual: 0,
                    });
                }
                vacant.insert(StoredRow {
                    version: 1,
                    payload,
                    updated_at: Utc::now(),
                });
                Ok(1)
            }
        }
    }

    async fn delete_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
    ) -> Result<(), StoreError> {
        match self.rows.entry((kind, id)) {
            Entry::Occupied(occupied) => {
                let actual = occupied.get().version;
                if actual != expected {
                    return Err(StoreError::VersionConflict {
                        kind,
                        id,
                        expected,
                        actual,
                    });
                }
                occupied.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(StoreError::VersionConflict {
                kind,
                id,
                expected,
                actual: 0,
            }),
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<VersionedRecord>, StoreError> {
        let mut records: Vec<VersionedRecord> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| Self::record(kind, entry.key().1, entry.value()))
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find_by_field(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        let mut records: Vec<VersionedRecord> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .filter(|entry| entry.value().payload.get(field).and_then(|v| v.as_str()) == Some(value))
            .map(|entry| Self::record(kind, entry.key().1, entry.value()))
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        let key = account_id.to_string();
        let mut records: Vec<VersionedRecord> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == EntityKind::Entry)
            .filter(|entry| {
                entry.value().payload.get("account_id").and_then(|v| v.as_str())
                    == Some(key.as_str())
            })
            .map(|entry| Self::record(EntityKind::Entry, entry.key().1, entry.value()))
            .collect();

        // Newest account write first
        records.sort_by_key(|r| {
            std::cmp::Reverse(
                r.payload
                    .get("account_version")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            )
        });

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
