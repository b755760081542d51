//! Idempotency gate.
//!
//! Prevents duplicate request processing. Callers supply a uuid key per
//! operation; the key is reserved with a conditional create before any
//! work happens, so two racing submissions of the same key collapse to one
//! execution. A completed key replays the stored receipt without touching
//! the ledger; the same key with a different request body is a conflict.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::LedgerError;
use crate::store::{encode, EntityKind, EntityStore, StoreError};

/// Reservations older than this may be retaken; the original worker is
/// presumed dead.
const STALE_PROCESSING_MINUTES: i64 = 5;

/// Completed and failed records are purged after this long.
const RETENTION_HOURS: i64 = 24;

/// Idempotency record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyStatus::Processing => write!(f, "processing"),
            IdempotencyStatus::Completed => write!(f, "completed"),
            IdempotencyStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Stored idempotency record. The receipt is the serialized operation
/// result, replayed verbatim on resubmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: Uuid,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Gate guarding every ledger operation behind an idempotency key.
pub struct IdempotencyGate {
    store: Arc<dyn EntityStore>,
    stale_after: Duration,
    retention: Duration,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            stale_after: Duration::minutes(STALE_PROCESSING_MINUTES),
            retention: Duration::hours(RETENTION_HOURS),
        }
    }

    /// Override the stale-reservation window.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Override the record retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Compute SHA-256 hash of the request body for conflict detection.
    pub fn compute_request_hash(body: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    /// Reserve a key before executing its operation.
    ///
    /// Returns `Ok(Some(receipt))` when the key already completed and the
    /// caller must replay the stored result, `Ok(None)` when the
    /// reservation is held and the operation should run.
    pub async fn start_processing(
        &self,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>, LedgerError> {
        let in_flight = || LedgerError::IdempotencyConflict {
            key,
            detail: "request with this key is still in flight".to_string(),
        };

        let existing = self.store.get(EntityKind::Idempotency, key).await?;
        let Some(stored) = existing else {
            let now = Utc::now();
            let fresh = IdempotencyRecord {
                key,
                request_hash: request_hash.to_string(),
                status: IdempotencyStatus::Processing,
                receipt: None,
                error: None,
                processing_started_at: now,
                created_at: now,
                expires_at: now + self.retention,
            };
            return match self
                .store
                .put_if_version(EntityKind::Idempotency, key, 0, encode(&fresh)?)
                .await
            {
                Ok(_) => Ok(None),
                // Lost the creation race: someone else holds the key
                Err(StoreError::VersionConflict { .. }) => Err(in_flight()),
                Err(e) => Err(e.into()),
            };
        };

        let record: IdempotencyRecord = stored.decode()?;

        if record.request_hash != request_hash {
            return Err(LedgerError::IdempotencyConflict {
                key,
                detail: "request hash does not match the original submission".to_string(),
            });
        }

        match record.status {
            IdempotencyStatus::Completed => Ok(Some(
                record
                    .receipt
                    .ok_or_else(|| LedgerError::Store("completed record has no receipt".into()))?,
            )),
            IdempotencyStatus::Processing
                if Utc::now() - record.processing_started_at < self.stale_after =>
            {
                Err(in_flight())
            }
            // Failed, or a reservation stuck past the stale window: retake
            _ => {
                let mut retaken = record;
                retaken.status = IdempotencyStatus::Processing;
                retaken.processing_started_at = Utc::now();
                retaken.error = None;
                match self
                    .store
                    .put_if_version(EntityKind::Idempotency, key, stored.version, encode(&retaken)?)
                    .await
                {
                    Ok(_) => Ok(None),
                    Err(StoreError::VersionConflict { .. }) => Err(in_flight()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Record the successful result for replay.
    pub async fn mark_completed(
        &self,
        key: Uuid,
        receipt: serde_json::Value,
    ) -> Result<(), LedgerError> {
        self.finish(key, IdempotencyStatus::Completed, Some(receipt), None)
            .await
    }

    /// Record a failure so the key can be retried.
    pub async fn mark_failed(&self, key: Uuid, error: &LedgerError) -> Result<(), LedgerError> {
        self.finish(key, IdempotencyStatus::Failed, None, Some(error.to_string()))
            .await
    }

    async fn finish(
        &self,
        key: Uuid,
        status: IdempotencyStatus,
        receipt: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let Some(existing) = self.store.get(EntityKind::Idempotency, key).await? else {
            return Err(LedgerError::Store(format!(
                "idempotency record {key} vanished while processing"
            )));
        };
        let mut record: IdempotencyRecord = existing.decode()?;
        record.status = status;
        record.receipt = receipt;
        record.error = error;
        self.store
            .put_if_version(EntityKind::Idempotency, key, existing.version, encode(&record)?)
            .await
            .map_err(|e| LedgerError::Store(format!("idempotency record {key}: {e}")))?;
        Ok(())
    }

    /// Delete expired records. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let mut removed = 0;
        for stored in self.store.list(EntityKind::Idempotency).await? {
            let record: IdempotencyRecord = stored.decode()?;
            if record.expires_at < now {
                match self
                    .store
                    .delete_if_version(EntityKind::Idempotency, stored.id, stored.version)
                    .await
                {
                    Ok(()) => removed += 1,
                    // Touched concurrently; next sweep will see it
                    Err(StoreError::VersionConflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    /// Demote reservations stuck in `processing` past the stale window to
    /// `failed` so resubmissions can proceed. Returns how many were reset.
    pub async fn reset_stale(&self) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let mut reset = 0;
        for stored in self.store.list(EntityKind::Idempotency).await? {
            let record: IdempotencyRecord = stored.decode()?;
            let stale = record.status == IdempotencyStatus::Processing
                && now - record.processing_started_at >= self.stale_after;
            if stale {
                let mut demoted = record;
                demoted.status = IdempotencyStatus::Failed;
                demoted.error = Some("reservation abandoned by a dead worker".to_string());
                match self
                    .store
                    .put_if_version(
                        EntityKind::Idempotency,
                        stored.id,
                        stored.version,
                        encode(&demoted)?,
                    )
                    .await
                {
                    Ok(_) => reset += 1,
                    Err(StoreError::VersionConflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(reset)
    }
}
