//! Storage and transport for the inspections sync: the Postgres-backed
//! `inspections`/`sync_runs` tables, an in-memory equivalent, and the HTTP
//! fetch utilities used against the open-data portal.

pub mod http;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use bfi_core::{InspectionRow, StoredInspection, SyncRun, PASSING_RESULTS};
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
pub use memory::MemoryInspectionStore;
pub use postgres::PgInspectionStore;

pub const CRATE_NAME: &str = "bfi-storage";

/// A `running` run older than this no longer blocks new runs; it is marked
/// failed as abandoned when the next run opens.
pub const STALE_RUN_AFTER_HOURS: i64 = 6;

/// Source label of runs against the live open-data feed. Health reports
/// freshness from these runs only.
pub const FEED_SOURCE: &str = "ckan";

/// Upper bound for the `by_zip` breakdown in [`InspectionStats`].
pub const TOP_ZIP_LIMIT: usize = 15;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage connection lost: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("row {key} rejected: {message}")]
    Row { key: String, message: String },
    #[error("sync run {run_id} is already running")]
    AlreadyRunning { run_id: Uuid },
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Fatal errors abort a sync run; everything else is scoped to one row
    /// or one query.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub(crate) fn from_query(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            StoreError::Connection(err)
        } else {
            StoreError::Query(err)
        }
    }

    pub(crate) fn from_row(key: &str, err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            StoreError::Connection(err)
        } else {
            StoreError::Row {
                key: key.to_string(),
                message: err.to_string(),
            }
        }
    }
}

pub fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Write side used by the sync pipeline.
#[async_trait]
pub trait InspectionStore: Send + Sync {
    /// Insert by `inspection_key`, or update the mutable fields when they
    /// differ. `updated_at` only moves on an actual change.
    async fn upsert(&self, row: &InspectionRow) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, inspection_key: &str) -> Result<Option<StoredInspection>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Persist a run in the `running` state. Fails with
    /// [`StoreError::AlreadyRunning`] while a non-stale run for the same
    /// source is open.
    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InspectionFilter {
    pub zip: Option<String>,
    pub result: Option<String>,
    pub since: NaiveDateTime,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectionPage {
    pub rows: Vec<StoredInspection>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultCount {
    pub result: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZipCount {
    pub zip: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectionStats {
    pub total_establishments: u64,
    pub passed: u64,
    pub assessed: u64,
    pub total_violations: u64,
    pub by_result: Vec<ResultCount>,
    pub by_zip: Vec<ZipCount>,
}

impl InspectionStats {
    /// Percentage of establishments whose latest inspection passed, one decimal.
    pub fn pass_rate(&self) -> f64 {
        if self.assessed == 0 {
            return 0.0;
        }
        let rate = self.passed as f64 / self.assessed as f64 * 100.0;
        (rate * 10.0).round() / 10.0
    }
}

pub fn is_passing_result(result: Option<&str>) -> bool {
    result.is_some_and(|r| PASSING_RESULTS.contains(&r))
}

/// Read side used by the query layer and health checks.
#[async_trait]
pub trait InspectionQueries: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Most recent inspection per establishment (business name + address),
    /// restricted to rows with coordinates, newest first.
    async fn latest_inspections(&self, filter: &InspectionFilter) -> Result<InspectionPage, StoreError>;

    async fn stats(&self, since: NaiveDateTime) -> Result<InspectionStats, StoreError>;

    async fn zip_counts(&self) -> Result<Vec<ZipCount>, StoreError>;

    async fn result_codes(&self) -> Result<Vec<String>, StoreError>;

    /// Most recently started run recorded under `source`.
    async fn last_run(&self, source: &str) -> Result<Option<SyncRun>, StoreError>;

    async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRun>, StoreError>;
}
