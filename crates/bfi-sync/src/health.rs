//! Freshness assessment over the most recent sync run.

use bfi_core::{SyncRun, SyncState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A run that finished longer ago than this makes the dataset stale.
pub const STALE_AFTER_HOURS: i64 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reason: Option<String>,
    pub last_run_id: Option<Uuid>,
    pub last_run_state: Option<SyncState>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub hours_since_sync: Option<f64>,
    pub records_synced: u64,
}

impl HealthReport {
    fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            reason: Some(reason.into()),
            last_run_id: None,
            last_run_state: None,
            last_sync_at: None,
            hours_since_sync: None,
            records_synced: 0,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// A run still in progress is judged by its start time.
pub fn assess_health(last_run: Option<&SyncRun>, now: DateTime<Utc>) -> HealthReport {
    let Some(run) = last_run else {
        return HealthReport::unhealthy("no sync run recorded");
    };
    let Some(reference) = run.finished_at.or(run.started_at) else {
        return HealthReport::unhealthy(format!("sync run {} never started", run.run_id));
    };

    let age = now.signed_duration_since(reference);
    let hours = (age.num_minutes() as f64 / 60.0 * 10.0).round() / 10.0;

    let (status, reason) = if age > chrono::Duration::hours(STALE_AFTER_HOURS) {
        (
            HealthStatus::Degraded,
            Some(format!("stale: last sync {hours} hours ago")),
        )
    } else if run.state == SyncState::Failed {
        (
            HealthStatus::Degraded,
            Some(
                run.error_detail
                    .clone()
                    .unwrap_or_else(|| "last sync failed".to_string()),
            ),
        )
    } else {
        (HealthStatus::Healthy, None)
    };

    HealthReport {
        status,
        reason,
        last_run_id: Some(run.run_id),
        last_run_state: Some(run.state),
        last_sync_at: Some(reference),
        hours_since_sync: Some(hours),
        records_synced: run.counts.synced(),
    }
}
