//! In-process store with the same upsert and projection semantics as the
//! Postgres tables. Backs `sync --dry-run` and the test suites.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bfi_core::{InspectionRow, StoredInspection, SyncRun, SyncState};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    is_passing_result, InspectionFilter, InspectionPage, InspectionQueries, InspectionStats,
    InspectionStore, ResultCount, StoreError, UpsertOutcome, ZipCount, STALE_RUN_AFTER_HOURS,
    TOP_ZIP_LIMIT,
};

type EstablishmentKey = (Option<String>, Option<String>);

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<String, StoredInspection>,
    runs: Vec<SyncRun>,
}

#[derive(Debug, Default)]
pub struct MemoryInspectionStore {
    state: Mutex<MemoryState>,
}

impl MemoryInspectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<StoredInspection> {
        let state = self.state.lock().await;
        let mut rows = state.rows.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| a.row.inspection_key.cmp(&b.row.inspection_key));
        rows
    }
}

fn establishment(row: &InspectionRow) -> EstablishmentKey {
    (row.business_name.clone(), row.address.clone())
}

fn in_window(row: &InspectionRow, since: NaiveDateTime) -> bool {
    row.result_at.is_some_and(|ts| ts >= since)
}

/// Newest `result_at` wins; ties go to the smaller key so output is stable.
fn newer(candidate: &StoredInspection, current: &StoredInspection) -> bool {
    match candidate.row.result_at.cmp(&current.row.result_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate.row.inspection_key < current.row.inspection_key,
    }
}

fn latest_per_establishment<'a>(
    rows: impl Iterator<Item = &'a StoredInspection>,
) -> Vec<&'a StoredInspection> {
    let mut latest: BTreeMap<EstablishmentKey, &StoredInspection> = BTreeMap::new();
    for row in rows {
        latest
            .entry(establishment(&row.row))
            .and_modify(|current| {
                if newer(row, current) {
                    *current = row;
                }
            })
            .or_insert(row);
    }
    latest.into_values().collect()
}

fn sorted_counts<K: Ord + Clone>(counts: BTreeMap<K, u64>) -> Vec<(K, u64)> {
    let mut out = counts.into_iter().collect::<Vec<_>>();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

fn close_stale_runs(runs: &mut [SyncRun], now: DateTime<Utc>) {
    let stale_before = now - Duration::hours(STALE_RUN_AFTER_HOURS);
    for run in runs.iter_mut().filter(|r| {
        r.state == SyncState::Running && r.started_at.is_some_and(|t| t <= stale_before)
    }) {
        let counts = run.counts;
        let _ = run.fail(counts, "abandoned: exceeded stale run threshold", now);
    }
}

#[async_trait]
impl InspectionStore for MemoryInspectionStore {
    async fn upsert(&self, row: &InspectionRow) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let rows = &mut state.rows;
        let now = Utc::now();
        match rows.get_mut(&row.inspection_key) {
            None => {
                rows.insert(
                    row.inspection_key.clone(),
                    StoredInspection {
                        row: row.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if existing.row.same_mutable_fields(row) => Ok(UpsertOutcome::Unchanged),
            Some(existing) => {
                existing.row.apply_mutable_fields(row);
                existing.updated_at = now.max(existing.updated_at + Duration::microseconds(1));
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn get(&self, inspection_key: &str) -> Result<Option<StoredInspection>, StoreError> {
        Ok(self.state.lock().await.rows.get(inspection_key).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.rows.len() as u64)
    }

    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        if run.state != SyncState::Running {
            return Err(StoreError::Corrupt(format!(
                "run {} must be running to begin, found {}",
                run.run_id, run.state
            )));
        }
        let mut state = self.state.lock().await;
        close_stale_runs(&mut state.runs, Utc::now());
        // One open run at a time, whatever its source.
        if let Some(open) = state.runs.iter().find(|r| r.state == SyncState::Running) {
            return Err(StoreError::AlreadyRunning { run_id: open.run_id });
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.runs.iter_mut().find(|r| r.run_id == run.run_id) else {
            return Err(StoreError::Corrupt(format!("unknown sync run {}", run.run_id)));
        };
        *stored = run.clone();
        Ok(())
    }
}

#[async_trait]
impl InspectionQueries for MemoryInspectionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn latest_inspections(&self, filter: &InspectionFilter) -> Result<InspectionPage, StoreError> {
        let state = self.state.lock().await;
        let matching = state.rows.values().filter(|r| {
            in_window(&r.row, filter.since)
                && r.row.coordinates.is_some()
                && filter.zip.as_ref().is_none_or(|zip| r.row.zip.as_ref() == Some(zip))
                && filter
                    .result
                    .as_ref()
                    .is_none_or(|result| r.row.result.as_ref() == Some(result))
        });
        let mut latest = latest_per_establishment(matching);
        latest.sort_by(|a, b| {
            b.row
                .result_at
                .cmp(&a.row.result_at)
                .then_with(|| a.row.inspection_key.cmp(&b.row.inspection_key))
        });

        let total = latest.len() as u64;
        let rows = latest
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();
        Ok(InspectionPage { rows, total })
    }

    async fn stats(&self, since: NaiveDateTime) -> Result<InspectionStats, StoreError> {
        let state = self.state.lock().await;
        let window = state
            .rows
            .values()
            .filter(|r| in_window(&r.row, since))
            .collect::<Vec<_>>();

        let total_establishments = window
            .iter()
            .map(|r| establishment(&r.row))
            .collect::<BTreeSet<_>>()
            .len() as u64;
        let total_violations = window.iter().filter(|r| r.row.violation_code.is_some()).count() as u64;

        let latest = latest_per_establishment(window.iter().copied());
        let passed = latest
            .iter()
            .filter(|r| is_passing_result(r.row.result.as_deref()))
            .count() as u64;

        let mut results = BTreeMap::<String, u64>::new();
        let mut zips = BTreeMap::<String, u64>::new();
        for row in &latest {
            if let Some(result) = &row.row.result {
                *results.entry(result.clone()).or_default() += 1;
            }
            if let Some(zip) = &row.row.zip {
                *zips.entry(zip.clone()).or_default() += 1;
            }
        }

        Ok(InspectionStats {
            total_establishments,
            passed,
            assessed: latest.len() as u64,
            total_violations,
            by_result: sorted_counts(results)
                .into_iter()
                .map(|(result, count)| ResultCount { result, count })
                .collect(),
            by_zip: sorted_counts(zips)
                .into_iter()
                .take(TOP_ZIP_LIMIT)
                .map(|(zip, count)| ZipCount { zip, count })
                .collect(),
        })
    }

    async fn zip_counts(&self) -> Result<Vec<ZipCount>, StoreError> {
        let state = self.state.lock().await;
        let mut per_zip = BTreeMap::<String, BTreeSet<EstablishmentKey>>::new();
        for row in state.rows.values() {
            if let Some(zip) = &row.row.zip {
                per_zip
                    .entry(zip.clone())
                    .or_default()
                    .insert(establishment(&row.row));
            }
        }
        Ok(per_zip
            .into_iter()
            .map(|(zip, establishments)| ZipCount {
                zip,
                count: establishments.len() as u64,
            })
            .collect())
    }

    async fn result_codes(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter_map(|r| r.row.result.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn last_run(&self, source: &str) -> Result<Option<SyncRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.source == source)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }
}
