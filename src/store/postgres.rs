//! Postgres entity store.
//!
//! One `entities` table keyed by (kind, id) with a JSONB payload. Each
//! conditional write is a single statement whose WHERE clause carries the
//! version check, so the database enforces the CAS without long-lived
//! transactions or row locks held across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{EntityKind, EntityStore, StoreError, VersionedRecord};

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema when it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                kind TEXT NOT NULL,
                id UUID NOT NULL,
                version BIGINT NOT NULL,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entities_entry_account
            ON entities ((payload->>'account_id'))
            WHERE kind = 'entry'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entities_owner
            ON entities ((payload->>'owner_id'))
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("entity store schema ready");
        Ok(())
    }

    async fn current_version(&self, kind: EntityKind, id: Uuid) -> Result<i64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM entities WHERE kind = $1 AND id = $2")
                .bind(kind.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }

    fn row_to_record(
        kind: EntityKind,
        row: (Uuid, i64, serde_json::Value, DateTime<Utc>),
    ) -> VersionedRecord {
        VersionedRecord {
            kind,
            id: row.0,
            version: row.1,
            payload: row.2,
            updated_at: row.3,
        }
    }
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<VersionedRecord>, StoreError> {
        let row: Option<(Uuid, i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, version, payload, updated_at
            FROM entities
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::row_to_record(kind, r)))
    }

    async fn put_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
        payload: serde_json::Value,
    ) -> Result<i64, StoreError> {
        if expected == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO entities (kind, id, version, payload)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (kind, id) DO NOTHING
                "#,
            )
            .bind(kind.as_str())
            .bind(id)
            .bind(&payload)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let actual = self.current_version(kind, id).await?;
                return Err(StoreError::VersionConflict {
                    kind,
                    id,
                    expected,
                    actual,
                });
            }
            return Ok(1);
        }

        let new_version = expected + 1;
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET version = $4, payload = $5, updated_at = NOW()
            WHERE kind = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(expected)
        .bind(new_version)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.current_version(kind, id).await?;
            return Err(StoreError::VersionConflict {
                kind,
                id,
                expected,
                actual,
            });
        }
        Ok(new_version)
    }

    async fn delete_if_version(
        &self,
        kind: EntityKind,
        id: Uuid,
        expected: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM entities
            WHERE kind = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.current_version(kind, id).await?;
            return Err(StoreError::VersionConflict {
                kind,
                id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<VersionedRecord>, StoreError> {
        let rows: Vec<(Uuid, i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, version, payload, updated_at
            FROM entities
            WHERE kind = $1
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Self::row_to_record(kind, r))
            .collect())
    }

    async fn find_by_field(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        let rows: Vec<(Uuid, i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, version, payload, updated_at
            FROM entities
            WHERE kind = $1 AND payload->>$2 = $3
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .bind(field)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Self::row_to_record(kind, r))
            .collect())
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VersionedRecord>, StoreError> {
        let rows: Vec<(Uuid, i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, version, payload, updated_at
            FROM entities
            WHERE kind = 'entry' AND payload->>'account_id' = $1
            ORDER BY (payload->>'account_version')::BIGINT DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Self::row_to_record(EntityKind::Entry, r))
            .collect())
    }
}
