//! Postgres-backed store for the `inspections` and `sync_runs` tables.

use std::time::Duration;

use async_trait::async_trait;
use bfi_core::{
    Coordinates, InspectionRow, RunCounts, StoredInspection, SyncRun, SyncState, PASSING_RESULTS,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::{
    InspectionFilter, InspectionPage, InspectionQueries, InspectionStats, InspectionStore,
    ResultCount, StoreError, UpsertOutcome, ZipCount, STALE_RUN_AFTER_HOURS, TOP_ZIP_LIMIT,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS inspections (
    id BIGSERIAL PRIMARY KEY,
    inspection_key TEXT NOT NULL UNIQUE,
    business_name TEXT,
    dba_name TEXT,
    legal_owner TEXT,
    license_no TEXT,
    license_status TEXT,
    license_category TEXT,
    license_issued_at TIMESTAMP,
    license_expires_at TIMESTAMP,
    result TEXT,
    result_at TIMESTAMP,
    violation_code TEXT,
    violation_level TEXT,
    violation_description TEXT,
    violation_at TIMESTAMP,
    violation_status TEXT,
    comments TEXT,
    address TEXT,
    city TEXT,
    state TEXT,
    zip TEXT,
    property_id TEXT,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT inspections_coordinates_paired CHECK ((latitude IS NULL) = (longitude IS NULL)),
    CONSTRAINT inspections_coordinates_in_boston CHECK (
        latitude IS NULL
        OR (latitude BETWEEN 42.2 AND 42.4 AND longitude BETWEEN -71.2 AND -70.9)
    )
);
CREATE INDEX IF NOT EXISTS idx_inspections_result_at ON inspections(result_at DESC);
CREATE INDEX IF NOT EXISTS idx_inspections_business_name ON inspections(business_name);
CREATE INDEX IF NOT EXISTS idx_inspections_zip ON inspections(zip);
CREATE INDEX IF NOT EXISTS idx_inspections_result ON inspections(result);
CREATE INDEX IF NOT EXISTS idx_inspections_license_status ON inspections(license_status);
CREATE INDEX IF NOT EXISTS idx_inspections_coords ON inspections(latitude, longitude);
CREATE TABLE IF NOT EXISTS sync_runs (
    run_id UUID PRIMARY KEY,
    source TEXT NOT NULL,
    days_back INTEGER NOT NULL,
    cutoff DATE NOT NULL,
    state TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    records_fetched BIGINT NOT NULL DEFAULT 0,
    records_inserted BIGINT NOT NULL DEFAULT 0,
    records_updated BIGINT NOT NULL DEFAULT 0,
    records_unchanged BIGINT NOT NULL DEFAULT 0,
    records_failed BIGINT NOT NULL DEFAULT 0,
    error_detail TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs(started_at DESC);
DROP INDEX IF EXISTS idx_sync_runs_one_running;
CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_single_running ON sync_runs ((true)) WHERE state = 'running'
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO inspections (
    inspection_key, business_name, dba_name, legal_owner,
    license_no, license_status, license_category,
    license_issued_at, license_expires_at,
    result, result_at,
    violation_code, violation_level, violation_description, violation_at, violation_status,
    comments, address, city, state, zip, property_id,
    latitude, longitude, created_at, updated_at
) VALUES (
    $1, $2, $3, $4,
    $5, $6, $7,
    $8, $9,
    $10, $11,
    $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22,
    $23, $24, $25, $25
)
ON CONFLICT (inspection_key) DO UPDATE SET
    result = EXCLUDED.result,
    license_status = EXCLUDED.license_status,
    violation_level = EXCLUDED.violation_level,
    violation_description = EXCLUDED.violation_description,
    violation_at = EXCLUDED.violation_at,
    violation_status = EXCLUDED.violation_status,
    comments = EXCLUDED.comments,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    updated_at = GREATEST(EXCLUDED.updated_at, inspections.updated_at + INTERVAL '1 microsecond')
WHERE (
    inspections.result, inspections.license_status,
    inspections.violation_level, inspections.violation_description,
    inspections.violation_at, inspections.violation_status, inspections.comments,
    inspections.latitude, inspections.longitude
) IS DISTINCT FROM (
    EXCLUDED.result, EXCLUDED.license_status,
    EXCLUDED.violation_level, EXCLUDED.violation_description,
    EXCLUDED.violation_at, EXCLUDED.violation_status, EXCLUDED.comments,
    EXCLUDED.latitude, EXCLUDED.longitude
)
RETURNING (xmax = 0) AS inserted
"#;

const INSPECTION_COLUMNS: &str = "inspection_key, business_name, dba_name, legal_owner, \
     license_no, license_status, license_category, license_issued_at, license_expires_at, \
     result, result_at, violation_code, violation_level, violation_description, violation_at, \
     violation_status, comments, address, city, state, zip, property_id, latitude, longitude, \
     created_at, updated_at";

const RUN_COLUMNS: &str = "run_id, source, days_back, cutoff, state, started_at, finished_at, \
     records_fetched, records_inserted, records_updated, records_unchanged, records_failed, \
     error_detail";

/// Pooled Postgres store. Each statement checks a connection out of the pool
/// and returns it when the statement future completes or is dropped.
#[derive(Debug, Clone)]
pub struct PgInspectionStore {
    pool: PgPool,
}

impl PgInspectionStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from_query)?;
            }
        }
        info!("inspections schema is up to date");
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct InspectionDbRow {
    inspection_key: String,
    business_name: Option<String>,
    dba_name: Option<String>,
    legal_owner: Option<String>,
    license_no: Option<String>,
    license_status: Option<String>,
    license_category: Option<String>,
    license_issued_at: Option<NaiveDateTime>,
    license_expires_at: Option<NaiveDateTime>,
    result: Option<String>,
    result_at: Option<NaiveDateTime>,
    violation_code: Option<String>,
    violation_level: Option<String>,
    violation_description: Option<String>,
    violation_at: Option<NaiveDateTime>,
    violation_status: Option<String>,
    comments: Option<String>,
    address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    property_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InspectionDbRow> for StoredInspection {
    fn from(r: InspectionDbRow) -> Self {
        let coordinates = match (r.latitude, r.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        };
        StoredInspection {
            row: InspectionRow {
                inspection_key: r.inspection_key,
                business_name: r.business_name,
                dba_name: r.dba_name,
                legal_owner: r.legal_owner,
                license_no: r.license_no,
                license_status: r.license_status,
                license_category: r.license_category,
                license_issued_at: r.license_issued_at,
                license_expires_at: r.license_expires_at,
                result: r.result,
                result_at: r.result_at,
                violation_code: r.violation_code,
                violation_level: r.violation_level,
                violation_description: r.violation_description,
                violation_at: r.violation_at,
                violation_status: r.violation_status,
                comments: r.comments,
                address: r.address,
                city: r.city,
                state: r.state,
                zip: r.zip,
                property_id: r.property_id,
                coordinates,
            },
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SyncRunDbRow {
    run_id: Uuid,
    source: String,
    days_back: i32,
    cutoff: NaiveDate,
    state: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    records_fetched: i64,
    records_inserted: i64,
    records_updated: i64,
    records_unchanged: i64,
    records_failed: i64,
    error_detail: Option<String>,
}

impl TryFrom<SyncRunDbRow> for SyncRun {
    type Error = StoreError;

    fn try_from(r: SyncRunDbRow) -> Result<Self, Self::Error> {
        let state = r
            .state
            .parse::<SyncState>()
            .map_err(|e| StoreError::Corrupt(format!("sync run {}: {e}", r.run_id)))?;
        Ok(SyncRun {
            run_id: r.run_id,
            source: r.source,
            days_back: u32::try_from(r.days_back).unwrap_or_default(),
            cutoff: r.cutoff,
            state,
            started_at: Some(r.started_at),
            finished_at: r.finished_at,
            counts: RunCounts {
                fetched: to_u64(r.records_fetched),
                inserted: to_u64(r.records_inserted),
                updated: to_u64(r.records_updated),
                unchanged: to_u64(r.records_unchanged),
                failed: to_u64(r.records_failed),
            },
            error_detail: r.error_detail,
        })
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[async_trait]
impl InspectionStore for PgInspectionStore {
    async fn upsert(&self, row: &InspectionRow) -> Result<UpsertOutcome, StoreError> {
        let inserted: Option<bool> = sqlx::query_scalar(UPSERT_SQL)
            .bind(&row.inspection_key)
            .bind(&row.business_name)
            .bind(&row.dba_name)
            .bind(&row.legal_owner)
            .bind(&row.license_no)
            .bind(&row.license_status)
            .bind(&row.license_category)
            .bind(row.license_issued_at)
            .bind(row.license_expires_at)
            .bind(&row.result)
            .bind(row.result_at)
            .bind(&row.violation_code)
            .bind(&row.violation_level)
            .bind(&row.violation_description)
            .bind(row.violation_at)
            .bind(&row.violation_status)
            .bind(&row.comments)
            .bind(&row.address)
            .bind(&row.city)
            .bind(&row.state)
            .bind(&row.zip)
            .bind(&row.property_id)
            .bind(row.latitude())
            .bind(row.longitude())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_row(&row.inspection_key, e))?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn get(&self, inspection_key: &str) -> Result<Option<StoredInspection>, StoreError> {
        let sql = format!("SELECT {INSPECTION_COLUMNS} FROM inspections WHERE inspection_key = $1");
        let row = sqlx::query_as::<_, InspectionDbRow>(&sql)
            .bind(inspection_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        Ok(row.map(Into::into))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inspections")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        Ok(to_u64(count))
    }

    async fn begin_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let started_at = match (run.state, run.started_at) {
            (SyncState::Running, Some(started_at)) => started_at,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "run {} must be running to begin, found {}",
                    run.run_id, run.state
                )))
            }
        };

        let stale_before = Utc::now() - chrono::Duration::hours(STALE_RUN_AFTER_HOURS);
        let abandoned = sqlx::query(
            r#"
            UPDATE sync_runs
               SET state = 'failed',
                   finished_at = NOW(),
                   error_detail = 'abandoned: exceeded stale run threshold'
             WHERE state = 'running'
               AND started_at <= $1
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_query)?;
        if abandoned.rows_affected() > 0 {
            info!(count = abandoned.rows_affected(), "marked stale sync runs as failed");
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, source, days_back, cutoff, state, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.source)
        .bind(i32::try_from(run.days_back).unwrap_or(i32::MAX))
        .bind(run.cutoff)
        .bind(run.state.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if err.as_database_error().is_some_and(|db| db.is_unique_violation()) => {
                let open: Option<Uuid> = sqlx::query_scalar(
                    "SELECT run_id FROM sync_runs WHERE state = 'running' LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from_query)?;
                Err(StoreError::AlreadyRunning {
                    run_id: open.unwrap_or(run.run_id),
                })
            }
            Err(err) => Err(StoreError::from_query(err)),
        }
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_runs
               SET state = $2,
                   finished_at = $3,
                   records_fetched = $4,
                   records_inserted = $5,
                   records_updated = $6,
                   records_unchanged = $7,
                   records_failed = $8,
                   error_detail = $9
             WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.state.as_str())
        .bind(run.finished_at)
        .bind(to_i64(run.counts.fetched))
        .bind(to_i64(run.counts.inserted))
        .bind(to_i64(run.counts.updated))
        .bind(to_i64(run.counts.unchanged))
        .bind(to_i64(run.counts.failed))
        .bind(&run.error_detail)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("unknown sync run {}", run.run_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl InspectionQueries for PgInspectionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        Ok(())
    }

    async fn latest_inspections(&self, filter: &InspectionFilter) -> Result<InspectionPage, StoreError> {
        let sql = format!(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (business_name, address) {INSPECTION_COLUMNS}
                  FROM inspections
                 WHERE result_at >= $1
                   AND latitude IS NOT NULL
                   AND longitude IS NOT NULL
                   AND ($2::text IS NULL OR zip = $2)
                   AND ($3::text IS NULL OR result = $3)
                 ORDER BY business_name, address, result_at DESC, inspection_key
            )
            SELECT {INSPECTION_COLUMNS}
              FROM latest
             ORDER BY result_at DESC, inspection_key
             LIMIT $4 OFFSET $5
            "#
        );
        let rows = sqlx::query_as::<_, InspectionDbRow>(&sql)
            .bind(filter.since)
            .bind(&filter.zip)
            .bind(&filter.result)
            .bind(i64::from(filter.limit))
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_query)?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT DISTINCT business_name, address
                  FROM inspections
                 WHERE result_at >= $1
                   AND latitude IS NOT NULL
                   AND longitude IS NOT NULL
                   AND ($2::text IS NULL OR zip = $2)
                   AND ($3::text IS NULL OR result = $3)
            ) establishments
            "#,
        )
        .bind(filter.since)
        .bind(&filter.zip)
        .bind(&filter.result)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        Ok(InspectionPage {
            rows: rows.into_iter().map(Into::into).collect(),
            total: to_u64(total),
        })
    }

    async fn stats(&self, since: NaiveDateTime) -> Result<InspectionStats, StoreError> {
        let total_establishments: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT DISTINCT business_name, address
                  FROM inspections
                 WHERE result_at >= $1
            ) establishments
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        let passing = PASSING_RESULTS.map(String::from).to_vec();
        let (passed, assessed): (i64, i64) = sqlx::query_as(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (business_name, address) result
                  FROM inspections
                 WHERE result_at >= $1
                 ORDER BY business_name, address, result_at DESC, inspection_key
            )
            SELECT COUNT(*) FILTER (WHERE result = ANY($2)), COUNT(*)
              FROM latest
            "#,
        )
        .bind(since)
        .bind(&passing)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        let total_violations: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inspections WHERE result_at >= $1 AND violation_code IS NOT NULL",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        let by_result: Vec<(String, i64)> = sqlx::query_as(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (business_name, address) result
                  FROM inspections
                 WHERE result_at >= $1
                 ORDER BY business_name, address, result_at DESC, inspection_key
            )
            SELECT result, COUNT(*) AS count
              FROM latest
             WHERE result IS NOT NULL
             GROUP BY result
             ORDER BY count DESC, result
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        let by_zip: Vec<(String, i64)> = sqlx::query_as(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (business_name, address) zip
                  FROM inspections
                 WHERE result_at >= $1
                 ORDER BY business_name, address, result_at DESC, inspection_key
            )
            SELECT zip, COUNT(*) AS count
              FROM latest
             WHERE zip IS NOT NULL
             GROUP BY zip
             ORDER BY count DESC, zip
             LIMIT $2
            "#,
        )
        .bind(since)
        .bind(TOP_ZIP_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_query)?;

        Ok(InspectionStats {
            total_establishments: to_u64(total_establishments),
            passed: to_u64(passed),
            assessed: to_u64(assessed),
            total_violations: to_u64(total_violations),
            by_result: by_result
                .into_iter()
                .map(|(result, count)| ResultCount { result, count: to_u64(count) })
                .collect(),
            by_zip: by_zip
                .into_iter()
                .map(|(zip, count)| ZipCount { zip, count: to_u64(count) })
                .collect(),
        })
    }

    async fn zip_counts(&self) -> Result<Vec<ZipCount>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT zip, COUNT(*) AS count
              FROM (
                  SELECT DISTINCT zip, business_name, address
                    FROM inspections
                   WHERE zip IS NOT NULL
              ) establishments
             GROUP BY zip
             ORDER BY zip
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_query)?;
        Ok(rows
            .into_iter()
            .map(|(zip, count)| ZipCount { zip, count: to_u64(count) })
            .collect())
    }

    async fn result_codes(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT DISTINCT result FROM inspections WHERE result IS NOT NULL ORDER BY result")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_query)
    }

    async fn last_run(&self, source: &str) -> Result<Option<SyncRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE source = $1 ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SyncRunDbRow>(&sql)
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        row.map(SyncRun::try_from).transpose()
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC LIMIT $1");
        let rows = sqlx::query_as::<_, SyncRunDbRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_query)?;
        rows.into_iter().map(SyncRun::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfi_core::BOSTON_BOUNDS;

    #[test]
    fn schema_splits_into_non_empty_statements() {
        let statements = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        assert_eq!(statements.len(), 11);
        assert!(statements
            .iter()
            .all(|s| s.starts_with("CREATE") || s.starts_with("DROP INDEX IF EXISTS")));
    }

    #[test]
    fn schema_guards_a_single_running_run_across_sources() {
        let index = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .find(|s| s.starts_with("CREATE UNIQUE INDEX"))
            .unwrap();
        assert!(index.contains("((true))"), "{index}");
        assert!(index.ends_with("WHERE state = 'running'"), "{index}");
        assert!(!index.contains("(source)"), "{index}");
    }

    #[test]
    fn schema_checks_coordinates_against_boston_bounds() {
        let bounds = BOSTON_BOUNDS;
        let check = format!(
            "latitude BETWEEN {:.1} AND {:.1} AND longitude BETWEEN {:.1} AND {:.1}",
            bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng
        );
        assert!(SCHEMA_SQL.contains(&check), "missing {check}");
    }

    #[test]
    fn changed_rows_always_get_a_later_updated_at() {
        assert!(UPSERT_SQL.contains(
            "updated_at = GREATEST(EXCLUDED.updated_at, inspections.updated_at + INTERVAL '1 microsecond')"
        ));
    }

    #[test]
    fn upsert_binds_every_placeholder() {
        for n in 1..=25 {
            assert!(UPSERT_SQL.contains(&format!("${n}")), "missing ${n}");
        }
        assert!(!UPSERT_SQL.contains("$26"));
    }

    #[test]
    fn stored_run_rows_convert_back_to_runs() {
        let run_id = Uuid::new_v4();
        let row = SyncRunDbRow {
            run_id,
            source: "ckan".into(),
            days_back: 90,
            cutoff: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            state: "failed".into(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            records_fetched: 10000,
            records_inserted: 9000,
            records_updated: 12,
            records_unchanged: 988,
            records_failed: 0,
            error_detail: Some("http status 503".into()),
        };
        let run = SyncRun::try_from(row).unwrap();
        assert_eq!(run.run_id, run_id);
        assert_eq!(run.state, SyncState::Failed);
        assert_eq!(run.counts.inserted, 9000);

        let bad = SyncRunDbRow {
            run_id,
            source: "ckan".into(),
            days_back: 90,
            cutoff: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            state: "exploded".into(),
            started_at: Utc::now(),
            finished_at: None,
            records_fetched: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            records_failed: 0,
            error_detail: None,
        };
        assert!(matches!(SyncRun::try_from(bad), Err(StoreError::Corrupt(_))));
    }
}
