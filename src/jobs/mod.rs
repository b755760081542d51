//! Scheduled Jobs
//!
//! Background jobs for periodic maintenance tasks.
//! The idempotency table needs tending: expired records are purged and
//! reservations abandoned by dead workers are demoted so retries can run.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::domain::LedgerError;
use crate::idempotency::IdempotencyGate;
use crate::store::EntityStore;

// =========================================================================
// Idempotency maintenance
// =========================================================================

/// Reset stale idempotency reservations stuck in `processing`.
/// Keys held past the stale window are demoted to `failed` to allow retry.
pub async fn reset_stale_idempotency_keys(gate: &IdempotencyGate) -> Result<u64, LedgerError> {
    let reset = gate.reset_stale().await?;

    if reset > 0 {
        tracing::warn!(reset = reset, "Reset stale processing idempotency keys");
    }

    Ok(reset)
}

/// Delete idempotency records past their retention window.
pub async fn delete_expired_idempotency_keys(gate: &IdempotencyGate) -> Result<u64, LedgerError> {
    let removed = gate.cleanup_expired().await?;

    if removed > 0 {
        tracing::info!(removed = removed, "Deleted expired idempotency keys");
    }

    Ok(removed)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval between maintenance sweeps (default: 1 minute)
    pub maintenance_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    gate: IdempotencyGate,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    /// Create a new job scheduler over the same store the engine writes to
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            gate: IdempotencyGate::new(store),
            config: JobSchedulerConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(store: Arc<dyn EntityStore>, config: JobSchedulerConfig) -> Self {
        Self {
            gate: IdempotencyGate::new(store),
            config,
        }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop
    async fn run(&self) {
        tracing::info!(
            interval_secs = self.config.maintenance_interval.as_secs(),
            "Job scheduler started"
        );

        let mut maintenance_interval = interval(self.config.maintenance_interval);

        loop {
            maintenance_interval.tick().await;

            if let Err(e) = reset_stale_idempotency_keys(&self.gate).await {
                tracing::error!(error = %e, "Idempotency key reset failed");
            }
            if let Err(e) = delete_expired_idempotency_keys(&self.gate).await {
                tracing::error!(error = %e, "Idempotency key deletion failed");
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match reset_stale_idempotency_keys(&self.gate).await {
            Ok(count) => report.idempotency_keys_reset = count,
            Err(e) => report.errors.push(format!("Idempotency reset: {}", e)),
        }

        match delete_expired_idempotency_keys(&self.gate).await {
            Ok(count) => report.idempotency_keys_deleted = count,
            Err(e) => report.errors.push(format!("Idempotency deletion: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub idempotency_keys_reset: u64,
    pub idempotency_keys_deleted: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

// =========================================================================
// Tests
// =========================================================================
