//! Ledger engine.
//!
//! Every money-moving operation follows one protocol: static validation,
//! idempotency key reservation, then a bounded loop of optimistic attempts.
//! Each attempt reads fresh state, re-validates the business rules against
//! it, stages conditional writes plus the ledger entries describing them,
//! and commits. A lost version check unwinds whatever was applied and the
//! loop tries again with jittered backoff; the budget runs out as
//! `Contention` when nothing ever stuck, `PartialFailureRecovered` when
//! legs were applied and rolled back.

mod card;
mod commit;
mod crypto;
mod funding;
mod reversal;
#[cfg(test)]
mod tests;
mod transfer;

pub use card::{CardCharge, CardRepayment};
pub use crypto::{CryptoBuy, CryptoSell};
pub use funding::{Deposit, Withdrawal};
pub use reversal::ReverseEntry;
pub use transfer::Transfer;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Account, AccountKind, CreditCard, CryptoPosition, EntryKind, EntryStatus, LedgerEntry,
    LedgerError, Money, OperationContext, OwnerType, Routing,
};
use crate::idempotency::IdempotencyGate;
use crate::oracle::PriceOracle;
use crate::store::{encode, EntityKind, EntityStore};

use commit::{CommitFailure, WritePlan};

/// Bounded retry with jittered linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt. Linear in the attempt number plus a
    /// random jitter so herds of losers do not retry in lockstep.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base_ms.max(1);
        let jitter = rand::thread_rng().gen_range(0..base);
        Duration::from_millis(base * (attempt as u64 + 1) + jitter)
    }
}

/// Result of a committed operation, also the replay payload stored under
/// its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReceipt {
    pub operation: String,
    pub correlation_id: Uuid,
    pub entries: Vec<LedgerEntry>,
    /// True when served from the idempotency store instead of executing.
    #[serde(default)]
    pub replayed: bool,
}

/// One ledger operation: its one-time preparation and its per-attempt plan.
#[async_trait]
pub(crate) trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time preparation after the key reservation and before the first
    /// attempt. Price quotes are fetched here: once per operation, reused
    /// across its retries.
    async fn prepare(
        &mut self,
        _store: &dyn EntityStore,
        _oracle: &dyn PriceOracle,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Build one attempt's write plan from fresh reads.
    async fn plan(
        &self,
        store: &dyn EntityStore,
        ctx: &OperationContext,
        key: Uuid,
    ) -> Result<WritePlan, LedgerError>;
}

/// The transactional ledger engine.
pub struct LedgerEngine {
    store: Arc<dyn EntityStore>,
    oracle: Arc<dyn PriceOracle>,
    idempotency: IdempotencyGate,
    retry: RetryPolicy,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn EntityStore>, oracle: Arc<dyn PriceOracle>) -> Self {
        let idempotency = IdempotencyGate::new(store.clone());
        Self {
            store,
            oracle,
            idempotency,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Open an account. Not idempotency-gated: the record id is fresh, so a
    /// duplicate submission opens a second account rather than corrupting
    /// the first.
    pub async fn open_account(
        &self,
        owner_id: Uuid,
        kind: AccountKind,
        owner_type: OwnerType,
        display_name: String,
        currency: crate::domain::Currency,
        routing: Option<Routing>,
        ctx: &OperationContext,
    ) -> Result<Account, LedgerError> {
        let account = Account::open(
            Uuid::new_v4(),
            owner_id,
            kind,
            owner_type,
            display_name,
            currency,
            routing,
        )?;
        self.store
            .put_if_version(EntityKind::Account, account.id, 0, encode(&account)?)
            .await?;
        tracing::info!(
            account = %account.id,
            owner = %owner_id,
            caller = %ctx.caller_id,
            "account opened"
        );
        Ok(account)
    }

    /// Issue a credit card with a zero balance owed.
    pub async fn issue_card(
        &self,
        owner_id: Uuid,
        display_name: String,
        limit: Money,
        ctx: &OperationContext,
    ) -> Result<CreditCard, LedgerError> {
        let card = CreditCard::issue(Uuid::new_v4(), owner_id, display_name, limit)?;
        self.store
            .put_if_version(EntityKind::Card, card.id, 0, encode(&card)?)
            .await?;
        tracing::info!(card = %card.id, owner = %owner_id, caller = %ctx.caller_id, "card issued");
        Ok(card)
    }

    /// Soft-close an account. Refused while funds remain or any crypto
    /// position is open.
    pub async fn close_account(
        &self,
        account_id: Uuid,
        ctx: &OperationContext,
    ) -> Result<Account, LedgerError> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            let loaded = load_account(self.store.as_ref(), account_id).await?;
            let open_positions = self
                .store
                .find_by_field(
                    EntityKind::Position,
                    "account_id",
                    &account_id.to_string(),
                )
                .await?;
            if !open_positions.is_empty() {
                return Err(LedgerError::validation(format!(
                    "account {account_id} still holds {} crypto position(s)",
                    open_positions.len()
                )));
            }

            let closed = loaded.entity.closed()?;
            match self
                .store
                .put_if_version(EntityKind::Account, account_id, loaded.version, encode(&closed)?)
                .await
            {
                Ok(_) => {
                    tracing::info!(account = %account_id, caller = %ctx.caller_id, "account closed");
                    return Ok(closed);
                }
                Err(err) if err.is_version_conflict() && attempt + 1 < attempts => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(err) if err.is_version_conflict() => {
                    return Err(LedgerError::Contention { attempts });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LedgerError::Contention { attempts })
    }

    // =========================================================================
    // Operation driver
    // =========================================================================

    /// Reserve the idempotency key, drive the operation, record the outcome.
    async fn run_operation<O: Operation>(
        &self,
        mut op: O,
        key: Uuid,
        request: serde_json::Value,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        let body = serde_json::to_vec(&request)
            .map_err(|e| LedgerError::Store(format!("canonicalizing request: {e}")))?;
        let hash = IdempotencyGate::compute_request_hash(&body);

        if let Some(stored) = self.idempotency.start_processing(key, &hash).await? {
            let mut receipt: OperationReceipt = serde_json::from_value(stored)
                .map_err(|e| LedgerError::Store(format!("stored receipt corrupt: {e}")))?;
            receipt.replayed = true;
            tracing::info!(operation = op.name(), key = %key, "replaying completed operation");
            return Ok(receipt);
        }

        let result = self.drive(&mut op, key, ctx).await;
        match &result {
            Ok(receipt) => {
                let value = serde_json::to_value(receipt)
                    .map_err(|e| LedgerError::Store(format!("serializing receipt: {e}")))?;
                self.idempotency.mark_completed(key, value).await?;
            }
            Err(err) => {
                if let Err(mark_err) = self.idempotency.mark_failed(key, err).await {
                    tracing::warn!(
                        operation = op.name(),
                        key = %key,
                        error = %mark_err,
                        "could not record operation failure"
                    );
                }
            }
        }
        result
    }

    /// The optimistic attempt loop.
    async fn drive<O: Operation>(
        &self,
        op: &mut O,
        key: Uuid,
        ctx: &OperationContext,
    ) -> Result<OperationReceipt, LedgerError> {
        op.prepare(self.store.as_ref(), self.oracle.as_ref()).await?;

        let attempts = self.retry.max_attempts.max(1);
        let mut compensated = false;
        let mut audit_entries: Vec<LedgerEntry> = Vec::new();

        for attempt in 0..attempts {
            // Cancellation is honored only while nothing from this
            // operation is committed; between attempts the net state is
            // untouched, so bailing here is still clean.
            if ctx.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }

            let plan = op.plan(self.store.as_ref(), ctx, key).await?;

            // The commit runs on a detached task: once the first write can
            // land, a dropped caller must not sever the protocol.
            let store = self.store.clone();
            let outcome = tokio::spawn(commit::commit(store, plan))
                .await
                .map_err(|e| LedgerError::Inconsistent(format!("commit task aborted: {e}")))?;

            match outcome {
                Ok(entries) => {
                    tracing::debug!(
                        operation = op.name(),
                        attempt = attempt + 1,
                        entries = entries.len(),
                        "operation committed"
                    );
                    return Ok(OperationReceipt {
                        operation: op.name().to_string(),
                        correlation_id: ctx.correlation_id,
                        entries,
                        replayed: false,
                    });
                }
                Err(CommitFailure::Conflict {
                    detail,
                    compensated: rolled_back,
                    entries,
                }) => {
                    compensated |= rolled_back;
                    audit_entries = entries;
                    tracing::warn!(
                        operation = op.name(),
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        detail = %detail,
                        "version conflict, retrying"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
                Err(CommitFailure::Recovered { detail, entries }) => {
                    self.append_failed_entries(entries).await;
                    return Err(LedgerError::PartialFailureRecovered(detail));
                }
                Err(CommitFailure::Inconsistent { detail }) => {
                    tracing::error!(
                        operation = op.name(),
                        key = %key,
                        detail = %detail,
                        "ledger left inconsistent; manual reconciliation required"
                    );
                    return Err(LedgerError::Inconsistent(detail));
                }
            }
        }

        if compensated {
            self.append_failed_entries(audit_entries).await;
            Err(LedgerError::PartialFailureRecovered(format!(
                "gave up after {attempts} attempts; applied legs were rolled back"
            )))
        } else {
            Err(LedgerError::Contention { attempts })
        }
    }

    /// Best-effort audit trail for attempts that were applied then rolled
    /// back. Failed entries never count toward balances.
    async fn append_failed_entries(&self, entries: Vec<LedgerEntry>) {
        for mut entry in entries {
            entry.status = EntryStatus::Failed;
            let payload = match encode(&entry) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(entry = %entry.id, error = %err, "could not encode failed entry");
                    continue;
                }
            };
            if let Err(err) = self
                .store
                .put_if_version(EntityKind::Entry, entry.id, 0, payload)
                .await
            {
                tracing::warn!(entry = %entry.id, error = %err, "could not record failed entry");
            }
        }
    }
}

// =========================================================================
// Shared load and entry helpers for the operation implementations
// =========================================================================

/// A decoded record plus what the CAS needs: its version and prior payload.
pub(crate) struct Loaded<T> {
    pub entity: T,
    pub version: i64,
    pub prior: serde_json::Value,
}

pub(crate) async fn load_account(
    store: &dyn EntityStore,
    id: Uuid,
) -> Result<Loaded<Account>, LedgerError> {
    let record = store
        .get(EntityKind::Account, id)
        .await?
        .ok_or_else(|| LedgerError::not_found("Account", id))?;
    Ok(Loaded {
        entity: record.decode()?,
        version: record.version,
        prior: record.payload,
    })
}

pub(crate) async fn load_card(
    store: &dyn EntityStore,
    id: Uuid,
) -> Result<Loaded<CreditCard>, LedgerError> {
    let record = store
        .get(EntityKind::Card, id)
        .await?
        .ok_or_else(|| LedgerError::not_found("Card", id))?;
    Ok(Loaded {
        entity: record.decode()?,
        version: record.version,
        prior: record.payload,
    })
}

pub(crate) async fn load_position(
    store: &dyn EntityStore,
    id: Uuid,
) -> Result<Option<Loaded<CryptoPosition>>, LedgerError> {
    let Some(record) = store.get(EntityKind::Position, id).await? else {
        return Ok(None);
    };
    Ok(Some(Loaded {
        entity: record.decode()?,
        version: record.version,
        prior: record.payload,
    }))
}

/// Fail unless the amount is strictly positive.
pub(crate) fn ensure_positive(amount: &Money) -> Result<(), LedgerError> {
    if !amount.is_positive() {
        return Err(LedgerError::validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

/// Build a completed entry for one leg of an operation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_entry(
    record_id: Uuid,
    kind: EntryKind,
    amount: Money,
    balance_after: Money,
    account_version: i64,
    description: String,
    ctx: &OperationContext,
    key: Uuid,
) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        account_id: record_id,
        kind,
        status: EntryStatus::Completed,
        amount,
        balance_after,
        account_version,
        description,
        correlation_id: ctx.correlation_id,
        idempotency_key: Some(key),
        caller_id: ctx.caller_id,
        created_at: chrono::Utc::now(),
    }
}
