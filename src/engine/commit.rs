//! Write plans and the commit protocol.
//!
//! An operation attempt stages every conditional write it wants to make,
//! then the plan is committed leg by leg. A leg that fails its version
//! check aborts the commit and unwinds the already-applied legs in reverse
//! order by restoring the state each one replaced. Ledger entries are
//! appended only after every entity write landed, so an entry can never
//! describe a write that did not happen.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::LedgerEntry;
use crate::store::{encode, EntityKind, EntityStore, StoreError};

/// How to undo an applied leg.
#[derive(Debug, Clone)]
enum Restore {
    /// Write back the state the leg replaced, at the version the leg wrote.
    Rewrite(serde_json::Value),
    /// The leg created the record; undo by deleting it.
    DeleteCreated,
    /// The leg deleted the record; undo by recreating it.
    Recreate(serde_json::Value),
}

/// One staged conditional write.
#[derive(Debug, Clone)]
pub(crate) struct StagedWrite {
    kind: EntityKind,
    id: Uuid,
    expected_version: i64,
    action: StagedAction,
}

#[derive(Debug, Clone)]
enum StagedAction {
    Put {
        payload: serde_json::Value,
        /// State before the write; `None` when the write creates the record.
        prior: Option<serde_json::Value>,
    },
    Delete {
        prior: serde_json::Value,
    },
}

/// Everything one attempt wants to persist.
#[derive(Debug, Clone, Default)]
pub(crate) struct WritePlan {
    writes: Vec<StagedWrite>,
    entries: Vec<LedgerEntry>,
}

impl WritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a conditional update or create.
    pub fn put(
        &mut self,
        kind: EntityKind,
        id: Uuid,
        expected_version: i64,
        payload: serde_json::Value,
        prior: Option<serde_json::Value>,
    ) {
        self.writes.push(StagedWrite {
            kind,
            id,
            expected_version,
            action: StagedAction::Put { payload, prior },
        });
    }

    /// Stage a conditional delete.
    pub fn delete(
        &mut self,
        kind: EntityKind,
        id: Uuid,
        expected_version: i64,
        prior: serde_json::Value,
    ) {
        self.writes.push(StagedWrite {
            kind,
            id,
            expected_version,
            action: StagedAction::Delete { prior },
        });
    }

    /// Record a ledger entry to append once every write has landed.
    pub fn record(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }
}

/// Why a commit did not complete.
#[derive(Debug)]
pub(crate) enum CommitFailure {
    /// A leg lost its version check. Applied legs were unwound;
    /// `compensated` says whether there was anything to unwind.
    Conflict {
        detail: String,
        compensated: bool,
        entries: Vec<LedgerEntry>,
    },
    /// A non-conflict failure mid-plan; applied legs were unwound.
    Recovered {
        detail: String,
        entries: Vec<LedgerEntry>,
    },
    /// Unwinding failed. State needs manual reconciliation.
    Inconsistent { detail: String },
}

/// One applied leg, remembered for the unwind path.
struct AppliedLeg {
    kind: EntityKind,
    id: Uuid,
    /// Version the leg wrote (unused for restores of deleted records).
    version_written: i64,
    restore: Restore,
}

/// Commit a plan: apply entity writes in order, then append entries.
pub(crate) async fn commit(
    store: Arc<dyn EntityStore>,
    plan: WritePlan,
) -> Result<Vec<LedgerEntry>, CommitFailure> {
    let mut applied: Vec<AppliedLeg> = Vec::with_capacity(plan.writes.len());

    for write in &plan.writes {
        let outcome = match &write.action {
            StagedAction::Put { payload, prior } => store
                .put_if_version(write.kind, write.id, write.expected_version, payload.clone())
                .await
                .map(|version| AppliedLeg {
                    kind: write.kind,
                    id: write.id,
                    version_written: version,
                    restore: match prior {
                        Some(prior) => Restore::Rewrite(prior.clone()),
                        None => Restore::DeleteCreated,
                    },
                }),
            StagedAction::Delete { prior } => store
                .delete_if_version(write.kind, write.id, write.expected_version)
                .await
                .map(|()| AppliedLeg {
                    kind: write.kind,
                    id: write.id,
                    version_written: 0,
                    restore: Restore::Recreate(prior.clone()),
                }),
        };

        match outcome {
            Ok(leg) => applied.push(leg),
            Err(err) => {
                let compensated = !applied.is_empty();
                unwind(store.as_ref(), applied).await.map_err(|detail| {
                    CommitFailure::Inconsistent {
                        detail: format!("unwind after failed leg: {detail}"),
                    }
                })?;
                return Err(if err.is_version_conflict() {
                    CommitFailure::Conflict {
                        detail: err.to_string(),
                        compensated,
                        entries: plan.entries,
                    }
                } else {
                    CommitFailure::Recovered {
                        detail: err.to_string(),
                        entries: plan.entries,
                    }
                });
            }
        }
    }

    // Entity writes are in; append the audit entries. Entry ids are fresh
    // uuids, so only an I/O failure can stop us here.
    for entry in &plan.entries {
        let payload = match encode(entry) {
            Ok(payload) => payload,
            Err(err) => {
                return fail_append(store.as_ref(), applied, plan.entries.clone(), err).await;
            }
        };
        match store.put_if_version(EntityKind::Entry, entry.id, 0, payload).await {
            Ok(_) => applied.push(AppliedLeg {
                kind: EntityKind::Entry,
                id: entry.id,
                version_written: 1,
                restore: Restore::DeleteCreated,
            }),
            Err(err) => {
                return fail_append(store.as_ref(), applied, plan.entries.clone(), err).await;
            }
        }
    }

    Ok(plan.entries)
}

async fn fail_append<E: std::fmt::Display>(
    store: &dyn EntityStore,
    applied: Vec<AppliedLeg>,
    entries: Vec<LedgerEntry>,
    err: E,
) -> Result<Vec<LedgerEntry>, CommitFailure> {
    let detail = format!("appending ledger entries: {err}");
    unwind(store, applied)
        .await
        .map_err(|unwind_detail| CommitFailure::Inconsistent {
            detail: format!("{detail}; unwind: {unwind_detail}"),
        })?;
    Err(CommitFailure::Recovered { detail, entries })
}

/// Undo applied legs in reverse order. Every leg is attempted even when an
/// earlier restore fails, to leave as little damage as possible.
async fn unwind(store: &dyn EntityStore, applied: Vec<AppliedLeg>) -> Result<(), String> {
    let mut failures: Vec<String> = Vec::new();

    for leg in applied.into_iter().rev() {
        let result: Result<(), StoreError> = match leg.restore {
            Restore::Rewrite(prior) => store
                .put_if_version(leg.kind, leg.id, leg.version_written, prior)
                .await
                .map(|_| ()),
            Restore::DeleteCreated => {
                store
                    .delete_if_version(leg.kind, leg.id, leg.version_written)
                    .await
            }
            Restore::Recreate(prior) => store
                .put_if_version(leg.kind, leg.id, 0, prior)
                .await
                .map(|_| ()),
        };

        if let Err(err) = result {
            tracing::error!(
                kind = %leg.kind,
                id = %leg.id,
                error = %err,
                "compensating write failed"
            );
            failures.push(format!("{} {}: {}", leg.kind, leg.id, err));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}
