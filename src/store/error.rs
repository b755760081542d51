//! Entity store errors.

use uuid::Uuid;

use super::EntityKind;
use crate::domain::LedgerError;

/// Errors that can occur in the entity store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict on a conditional write
    #[error("Version conflict for {kind} {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        kind: EntityKind,
        id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Injected or transport-level I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => LedgerError::NotFound {
                entity: kind.entity_name(),
                id,
            },
            other => LedgerError::Store(other.to_string()),
        }
    }
}
