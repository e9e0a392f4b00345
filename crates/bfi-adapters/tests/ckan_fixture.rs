use std::collections::HashSet;
use std::path::PathBuf;

use bfi_adapters::{FixtureSource, InspectionBatches};
use bfi_core::InspectionRow;
use chrono::NaiveDate;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ckan/sample_page.json")
}

#[tokio::test]
async fn sample_page_walks_in_batches_and_resolves_rows() {
    let source = FixtureSource::open(fixture_path()).expect("fixture loads");
    let cutoff = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let mut batches = InspectionBatches::new(&source, cutoff, 2);

    let mut rows = Vec::new();
    let mut batch_sizes = Vec::new();
    while let Some(batch) = batches.next_batch().await.expect("fixture pages") {
        batch_sizes.push(batch.len());
        rows.extend(batch.iter().map(InspectionRow::from_record));
    }

    assert_eq!(batch_sizes, vec![2, 2, 1]);
    assert_eq!(rows.len(), 5);

    let keys = rows.iter().map(|r| r.inspection_key.as_str()).collect::<HashSet<_>>();
    assert_eq!(keys.len(), 5, "two violations in one visit keep distinct keys");

    let located = rows.iter().filter(|r| r.coordinates.is_some()).count();
    assert_eq!(located, 3, "blank and out-of-region locations resolve to none");

    let sals = rows
        .iter()
        .find(|r| r.business_name.as_deref() == Some("Sal's Pizza"))
        .expect("Sal's Pizza row");
    assert_eq!(sals.license_no.as_deref(), Some("67210"));
    assert_eq!(sals.violation_code, None);
    assert_eq!(sals.latitude(), Some(42.3646));
}

#[tokio::test]
async fn later_cutoff_excludes_older_inspections() {
    let source = FixtureSource::open(fixture_path()).expect("fixture loads");
    let cutoff = NaiveDate::from_ymd_opt(2025, 9, 16).unwrap();
    let mut batches = InspectionBatches::new(&source, cutoff, 100);

    let batch = batches.next_batch().await.unwrap().expect("one batch");
    assert_eq!(batch.len(), 3);
    assert!(batches.next_batch().await.unwrap().is_none());
}
