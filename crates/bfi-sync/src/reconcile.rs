use bfi_core::InspectionRow;
use bfi_storage::{InspectionStore, StoreError, UpsertOutcome};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileTally {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl ReconcileTally {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.unchanged + self.failed
    }
}

/// A batch stopped by a storage failure that affects every later row.
#[derive(Debug)]
pub struct BatchAborted {
    pub tally: ReconcileTally,
    pub error: StoreError,
}

/// Upsert each row in order. Row-scoped failures are logged, counted and
/// skipped; a fatal storage error stops the batch and hands back the tally so
/// far.
pub async fn reconcile_batch(
    store: &dyn InspectionStore,
    rows: &[InspectionRow],
) -> Result<ReconcileTally, BatchAborted> {
    let mut tally = ReconcileTally::default();
    for row in rows {
        match store.upsert(row).await {
            Ok(outcome) => tally.record(outcome),
            Err(error) if error.is_fatal() => return Err(BatchAborted { tally, error }),
            Err(error) => {
                warn!(
                    inspection_key = %row.inspection_key,
                    business = row.business_name.as_deref().unwrap_or_default(),
                    %error,
                    "skipping inspection row"
                );
                tally.failed += 1;
            }
        }
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bfi_core::{InspectionRecord, StoredInspection, SyncRun};
    use bfi_storage::MemoryInspectionStore;

    fn row(business: &str, result: &str) -> InspectionRow {
        InspectionRow::from_record(&InspectionRecord {
            business_name: Some(business.into()),
            result_timestamp: Some("2025-09-01 10:00:00".into()),
            result: Some(result.into()),
            ..Default::default()
        })
    }

    /// Rejects rows for one business, or loses its connection after `budget` writes.
    struct BrokenStore {
        inner: MemoryInspectionStore,
        reject: Option<&'static str>,
        budget: Option<usize>,
        writes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl InspectionStore for BrokenStore {
        async fn upsert(&self, row: &InspectionRow) -> Result<UpsertOutcome, StoreError> {
            let n = self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.budget.is_some_and(|b| n >= b) {
                return Err(StoreError::Connection(sqlx::Error::PoolClosed));
            }
            if row.business_name.as_deref() == self.reject {
                return Err(StoreError::Row {
                    key: row.inspection_key.clone(),
                    message: "value too long for column".into(),
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

    #[tokio::test]
    async fn tallies_inserts_updates_and_unchanged() {
        let store = MemoryInspectionStore::new();
        let first = [row("A", "HE_Pass"), row("B", "HE_Fail")];
        let tally = reconcile_batch(&store, &first).await.unwrap();
        assert_eq!(tally.inserted, 2);

        let second = [row("A", "HE_Pass"), row("B", "HE_Pass")];
        let tally = reconcile_batch(&store, &second).await.unwrap();
        assert_eq!(
            tally,
            ReconcileTally { inserted: 0, updated: 1, unchanged: 1, failed: 0 }
        );
    }

    #[tokio::test]
    async fn colliding_keys_collapse_to_the_later_row() {
        for (earlier, later) in [("HE_Fail", "HE_Pass"), ("HE_Pass", "HE_Fail")] {
            let store = MemoryInspectionStore::new();
            let batch = [row("A", earlier), row("A", later)];
            assert_eq!(batch[0].inspection_key, batch[1].inspection_key);

            let tally = reconcile_batch(&store, &batch).await.unwrap();
            assert_eq!(tally.inserted, 1);
            assert_eq!(tally.updated, 1);

            let rows = store.rows().await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].row.result.as_deref(), Some(later));
        }
    }

    #[tokio::test]
    async fn row_failures_are_counted_and_skipped() {
        let store = BrokenStore {
            inner: MemoryInspectionStore::new(),
            reject: Some("B"),
            budget: None,
            writes: Default::default(),
        };
        let batch = [row("A", "HE_Pass"), row("B", "HE_Pass"), row("C", "HE_Pass")];
        let tally = reconcile_batch(&store, &batch).await.unwrap();
        assert_eq!(tally.inserted, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.processed(), 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_the_batch_with_partial_tally() {
        let store = BrokenStore {
            inner: MemoryInspectionStore::new(),
            reject: None,
            budget: Some(1),
            writes: Default::default(),
        };
        let batch = [row("A", "HE_Pass"), row("B", "HE_Pass"), row("C", "HE_Pass")];
        let aborted = reconcile_batch(&store, &batch).await.unwrap_err();
        assert_eq!(aborted.tally.inserted, 1);
        assert!(aborted.error.is_fatal());
        assert_eq!(store.inner.count().await.unwrap(), 1);
    }
}
