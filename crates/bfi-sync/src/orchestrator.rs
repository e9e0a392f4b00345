use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bfi_adapters::{InspectionBatches, InspectionSource};
use bfi_core::{InspectionRow, RunCounts, SyncRun};
use bfi_storage::{InspectionStore, StoreError};
use chrono::{Days, Utc};
use tracing::{error, info, info_span, Instrument};

use crate::reconcile::{reconcile_batch, ReconcileTally};
use crate::{validate_days_back, SyncError};

/// Clears the in-progress flag on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn absorb(counts: &mut RunCounts, tally: ReconcileTally) {
    counts.inserted += tally.inserted;
    counts.updated += tally.updated;
    counts.unchanged += tally.unchanged;
    counts.failed += tally.failed;
}

pub struct SyncOrchestrator {
    source: Arc<dyn InspectionSource>,
    store: Arc<dyn InspectionStore>,
    page_size: u32,
    running: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn InspectionSource>,
        store: Arc<dyn InspectionStore>,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            store,
            page_size: page_size.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Sync everything inspected in the last `days_back` days.
    ///
    /// The returned run is `Succeeded`; a run that opened and then failed is
    /// persisted as `Failed` and reported as [`SyncError::RunFatal`].
    pub async fn run(&self, days_back: u32) -> Result<SyncRun, SyncError> {
        let days_back = validate_days_back(days_back)?;
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            return Err(SyncError::AlreadyRunning { run_id: None });
        };

        let today = Utc::now().date_naive();
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(days_back)))
            .ok_or_else(|| SyncError::Config(format!("cannot go back {days_back} days")))?;

        let mut run = SyncRun::new(self.source.source_id(), days_back, cutoff);
        run.start(Utc::now())?;
        match self.store.begin_run(&run).await {
            Ok(()) => {}
            Err(StoreError::AlreadyRunning { run_id }) => {
                return Err(SyncError::AlreadyRunning { run_id: Some(run_id) })
            }
            Err(err) => return Err(SyncError::Store(err)),
        }

        let span = info_span!("sync_run", run_id = %run.run_id, days_back, %cutoff);
        self.execute(run).instrument(span).await
    }

    async fn execute(&self, mut run: SyncRun) -> Result<SyncRun, SyncError> {
        info!(source = %run.source, "sync run started");
        let (counts, failure) = self.drive(&run).await;

        let Some(detail) = failure else {
            run.succeed(counts, Utc::now())?;
            self.store.finish_run(&run).await?;
            info!(
                fetched = counts.fetched,
                inserted = counts.inserted,
                updated = counts.updated,
                unchanged = counts.unchanged,
                failed = counts.failed,
                "sync run succeeded"
            );
            return Ok(run);
        };

        run.fail(counts, detail.clone(), Utc::now())?;
        if let Err(finish_err) = self.store.finish_run(&run).await {
            error!(error = %finish_err, "could not record failed sync run");
        }
        error!(
            fetched = counts.fetched,
            inserted = counts.inserted,
            updated = counts.updated,
            %detail,
            "sync run failed"
        );
        Err(SyncError::RunFatal {
            run_id: run.run_id,
            detail,
            tally: counts,
        })
    }

    /// Fetch and reconcile batches until the source is exhausted or a fatal
    /// error occurs. Returns the totals and, on failure, its detail.
    async fn drive(&self, run: &SyncRun) -> (RunCounts, Option<String>) {
        let mut counts = RunCounts::default();
        let mut batches = InspectionBatches::new(self.source.as_ref(), run.cutoff, self.page_size);

        loop {
            let records = match batches.next_batch().await {
                Ok(Some(records)) => records,
                Ok(None) => return (counts, None),
                Err(err) => {
                    let detail = format!(
                        "fetch at offset {} gave up after {} attempt(s): {err}",
                        batches.offset(),
                        err.attempts()
                    );
                    return (counts, Some(detail));
                }
            };

            counts.fetched += records.len() as u64;
            let rows = records.iter().map(InspectionRow::from_record).collect::<Vec<_>>();

            match reconcile_batch(self.store.as_ref(), &rows).await {
                Ok(tally) => absorb(&mut counts, tally),
                Err(aborted) => {
                    absorb(&mut counts, aborted.tally);
                    return (counts, Some(format!("storage failure: {}", aborted.error)));
                }
            }

            info!(
                fetched = counts.fetched,
                inserted = counts.inserted,
                updated = counts.updated,
                unchanged = counts.unchanged,
                failed = counts.failed,
                "batch reconciled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bfi_adapters::{FetchedPage, FixtureSource, PageQuery};
    use bfi_core::{InspectionRecord, StoredInspection, SyncState};
    use bfi_storage::{
        FetchError, InspectionQueries, MemoryInspectionStore, UpsertOutcome, FEED_SOURCE,
    };
    use tokio::sync::Notify;

    fn recent(days_ago: u64) -> String {
        let day = Utc::now().date_naive() - Days::new(days_ago);
        format!("{}T10:30:00", day.format("%Y-%m-%d"))
    }

    fn record(business: &str, location: &str) -> InspectionRecord {
        InspectionRecord {
            business_name: Some(business.into()),
            address: Some(format!("{business} St")),
            result: Some("HE_Pass".into()),
            result_timestamp: Some(recent(3)),
            location: Some(location.into()),
            ..Default::default()
        }
    }

    fn three_records() -> Vec<InspectionRecord> {
        vec![
            record("Sal's Pizza", "(42.3646, -71.0542)"),
            record("Harbor Noodle", "(42.3513, -71.0451)"),
            record("Out Of Town", "(40.7128, -74.0060)"),
        ]
    }

    /// Fails every page after the first `ok_pages`.
    struct FlakySource {
        inner: FixtureSource,
        ok_pages: u64,
    }

    #[async_trait]
    impl InspectionSource for FlakySource {
        fn source_id(&self) -> &str {
            "flaky"
        }

        async fn fetch_page(&self, query: &PageQuery) -> Result<FetchedPage, FetchError> {
            if query.offset / u64::from(query.limit) >= self.ok_pages {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://data.example/api".into(),
                    attempts: 4,
                });
            }
            self.inner.fetch_page(query).await
        }
    }

    /// Holds the first page until released.
    struct GatedSource {
        inner: FixtureSource,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl InspectionSource for GatedSource {
        fn source_id(&self) -> &str {
            "gated"
        }

        async fn fetch_page(&self, query: &PageQuery) -> Result<FetchedPage, FetchError> {
            self.gate.notified().await;
            self.gate.notify_one();
            self.inner.fetch_page(query).await
        }
    }

    /// Rejects one business as a row error, or drops the connection outright.
    struct FaultyStore {
        inner: Arc<MemoryInspectionStore>,
        reject: &'static str,
        connection_lost: bool,
    }

    #[async_trait]
    impl InspectionStore for FaultyStore {
        async fn upsert(&self, row: &InspectionRow) -> Result<UpsertOutcome, StoreError> {
            if row.business_name.as_deref() == Some(self.reject) {
                if self.connection_lost {
                    return Err(StoreError::Connection(sqlx::Error::PoolTimedOut));
                }
                return Err(StoreError::Row {
                    key: row.inspection_key.clone(),
                    message: "check constraint violated".into(),
                });
            }
            self.inner.upsert(row).await
        }

        async fn get(&self, key: &str) -> Result<Option<StoredInspection>, StoreError> {
            self.inner.get(key).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }

        async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError> {
            self.inner.begin_run(run).await
        }

        async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError> {
            self.inner.finish_run(run).await
        }
    }

    fn fixture(records: Vec<InspectionRecord>) -> FixtureSource {
        FixtureSource::from_records("fixture", records)
    }

    #[tokio::test]
    async fn end_to_end_run_inserts_and_drops_out_of_region_coordinates() {
        let store = Arc::new(MemoryInspectionStore::new());
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store.clone(), 10000);

        let run = orchestrator.run(90).await.unwrap();
        assert_eq!(run.state, SyncState::Succeeded);
        assert_eq!(run.counts.fetched, 3);
        assert_eq!(run.counts.inserted, 3);

        let rows = store.rows().await;
        assert_eq!(rows.len(), 3);
        let unlocated = rows.iter().filter(|r| r.row.coordinates.is_none()).collect::<Vec<_>>();
        assert_eq!(unlocated.len(), 1);
        assert_eq!(unlocated[0].row.business_name.as_deref(), Some("Out Of Town"));

        let persisted = store.last_run("fixture").await.unwrap().unwrap();
        assert_eq!(persisted.run_id, run.run_id);
        assert_eq!(persisted.state, SyncState::Succeeded);
    }

    #[tokio::test]
    async fn rerunning_the_window_is_idempotent() {
        let store = Arc::new(MemoryInspectionStore::new());
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store.clone(), 2);

        orchestrator.run(90).await.unwrap();
        let before = store.rows().await;
        let second = orchestrator.run(90).await.unwrap();
        assert_eq!(second.counts.inserted, 0);
        assert_eq!(second.counts.updated, 0);
        assert_eq!(second.counts.unchanged, 3);
        assert_eq!(store.rows().await, before);
    }

    #[tokio::test]
    async fn records_before_the_cutoff_are_not_fetched() {
        let mut records = three_records();
        records[0].result_timestamp = Some(recent(45));
        let store = Arc::new(MemoryInspectionStore::new());
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(records)), store.clone(), 10000);

        let run = orchestrator.run(30).await.unwrap();
        assert_eq!(run.counts.fetched, 2);
        assert_eq!(run.cutoff, Utc::now().date_naive() - Days::new(30));
    }

    #[tokio::test]
    async fn fetch_failure_on_second_batch_keeps_first_batch_tallies() {
        let store = Arc::new(MemoryInspectionStore::new());
        let source = FlakySource { inner: fixture(three_records()), ok_pages: 1 };
        let orchestrator = SyncOrchestrator::new(Arc::new(source), store.clone(), 1);

        let err = orchestrator.run(90).await.unwrap_err();
        let SyncError::RunFatal { run_id, detail, tally } = err else {
            panic!("expected a fatal run error");
        };
        assert_eq!(tally.fetched, 1);
        assert_eq!(tally.inserted, 1);
        assert!(detail.contains("4 attempt(s)"), "{detail}");

        let persisted = store.last_run("flaky").await.unwrap().unwrap();
        assert_eq!(persisted.run_id, run_id);
        assert_eq!(persisted.state, SyncState::Failed);
        assert_eq!(persisted.counts.inserted, 1);
        assert!(persisted.error_detail.is_some());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn row_failures_do_not_fail_the_run() {
        let memory = Arc::new(MemoryInspectionStore::new());
        let store = Arc::new(FaultyStore {
            inner: memory.clone(),
            reject: "Harbor Noodle",
            connection_lost: false,
        });
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store, 10000);

        let run = orchestrator.run(90).await.unwrap();
        assert_eq!(run.state, SyncState::Succeeded);
        assert_eq!(run.counts.inserted, 2);
        assert_eq!(run.counts.failed, 1);
        assert_eq!(memory.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lost_connection_fails_the_run() {
        let memory = Arc::new(MemoryInspectionStore::new());
        let store = Arc::new(FaultyStore {
            inner: memory.clone(),
            reject: "Harbor Noodle",
            connection_lost: true,
        });
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store, 10000);

        let err = orchestrator.run(90).await.unwrap_err();
        assert!(matches!(err, SyncError::RunFatal { tally, .. } if tally.inserted == 1));
        let persisted = memory.last_run("fixture").await.unwrap().unwrap();
        assert_eq!(persisted.state, SyncState::Failed);
    }

    #[tokio::test]
    async fn concurrent_run_on_one_orchestrator_is_rejected() {
        let gate = Arc::new(Notify::new());
        let source = GatedSource { inner: fixture(three_records()), gate: gate.clone() };
        let orchestrator = SyncOrchestrator::new(
            Arc::new(source),
            Arc::new(MemoryInspectionStore::new()),
            10000,
        );

        let (first, second) = tokio::join!(orchestrator.run(90), async {
            let second = orchestrator.run(90).await;
            gate.notify_one();
            second
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadyRunning { run_id: None })));

        // Guard is released once the first run finishes.
        assert!(orchestrator.run(90).await.is_ok());
    }

    #[tokio::test]
    async fn open_run_in_storage_blocks_a_new_run() {
        let store = Arc::new(MemoryInspectionStore::new());
        let mut other = SyncRun::new("fixture", 90, Utc::now().date_naive() - Days::new(90));
        other.start(Utc::now()).unwrap();
        store.begin_run(&other).await.unwrap();

        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store, 10000);
        let err = orchestrator.run(90).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { run_id: Some(id) } if id == other.run_id));
    }

    #[tokio::test]
    async fn open_feed_run_blocks_a_fixture_run() {
        let store = Arc::new(MemoryInspectionStore::new());
        let mut feed = SyncRun::new(FEED_SOURCE, 90, Utc::now().date_naive() - Days::new(90));
        feed.start(Utc::now()).unwrap();
        store.begin_run(&feed).await.unwrap();

        let source = FixtureSource::from_records("fixture:/tmp/page.json", three_records());
        let orchestrator = SyncOrchestrator::new(Arc::new(source), store.clone(), 10000);
        let err = orchestrator.run(90).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { run_id: Some(id) } if id == feed.run_id));

        assert_eq!(store.count().await.unwrap(), 0);
        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(store.last_run(FEED_SOURCE).await.unwrap().unwrap().run_id, feed.run_id);
    }

    #[tokio::test]
    async fn days_back_outside_range_is_a_config_error() {
        let store = Arc::new(MemoryInspectionStore::new());
        let orchestrator = SyncOrchestrator::new(Arc::new(fixture(three_records())), store.clone(), 10);
        assert!(matches!(orchestrator.run(0).await, Err(SyncError::Config(_))));
        assert!(matches!(orchestrator.run(3651).await, Err(SyncError::Config(_))));
        assert!(store.recent_runs(10).await.unwrap().is_empty());
    }
}
