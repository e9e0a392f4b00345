//! Sync pipeline: configuration, per-batch reconciliation, the run
//! orchestrator and health assessment over persisted runs.

pub mod config;
pub mod health;
pub mod orchestrator;
pub mod reconcile;

use bfi_core::{RunCounts, TransitionError};
use bfi_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub use config::{validate_days_back, SyncConfig, MAX_DAYS_BACK, MAX_PAGE_SIZE, MIN_DAYS_BACK};
pub use health::{assess_health, HealthReport, HealthStatus, STALE_AFTER_HOURS};
pub use orchestrator::SyncOrchestrator;
pub use reconcile::{reconcile_batch, BatchAborted, ReconcileTally};

pub const CRATE_NAME: &str = "bfi-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    /// `run_id` is known when the conflicting run was found in storage.
    #[error("a sync run is already in progress")]
    AlreadyRunning { run_id: Option<Uuid> },
    #[error("sync run {run_id} failed: {detail}")]
    RunFatal {
        run_id: Uuid,
        detail: String,
        tally: RunCounts,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("sync run storage: {0}")]
    Store(#[from] StoreError),
}
