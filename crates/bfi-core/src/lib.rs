//! Core domain model for the Boston food inspections sync.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bfi-core";

/// Result codes counted as a pass by the stats projection.
pub const PASSING_RESULTS: [&str; 4] = ["Pass", "HE_Pass", "NoViol", "PassViol"];

/// Rectangular validity region for coordinates; bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

pub const BOSTON_BOUNDS: BoundingBox = BoundingBox {
    min_lat: 42.2,
    max_lat: 42.4,
    min_lng: -71.2,
    max_lng: -70.9,
};

/// A validated latitude/longitude pair inside [`BOSTON_BOUNDS`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

static LOCATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(\s*([+-]?[0-9]*\.?[0-9]+)\s*,\s*([+-]?[0-9]*\.?[0-9]+)\s*\)$")
        .expect("valid location regex")
});

/// Extract a `(lat, lng)` pair from the feed's free-text location field.
///
/// Returns `None` for missing, malformed or out-of-region input. A missing
/// location is routine for this feed, so nothing here is treated as an error.
pub fn parse_coordinates(raw: Option<&str>) -> Option<Coordinates> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let Some(captures) = LOCATION_PATTERN.captures(raw) else {
        debug!(location = raw, "location does not match (lat, lng) pattern");
        return None;
    };
    let latitude = captures.get(1)?.as_str().parse::<f64>().ok()?;
    let longitude = captures.get(2)?.as_str().parse::<f64>().ok()?;
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    if !BOSTON_BOUNDS.contains(latitude, longitude) {
        debug!(latitude, longitude, "coordinates outside Boston bounds");
        return None;
    }
    Some(Coordinates { latitude, longitude })
}

/// One record as served by the CKAN datastore. Every field is optional on the
/// wire and numeric-looking values may arrive as JSON numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionRecord {
    #[serde(rename = "businessname", default, deserialize_with = "lenient_string")]
    pub business_name: Option<String>,
    #[serde(rename = "dbaname", default, deserialize_with = "lenient_string")]
    pub dba_name: Option<String>,
    #[serde(rename = "legalowner", default, deserialize_with = "lenient_string")]
    pub legal_owner: Option<String>,
    #[serde(rename = "licenseno", default, deserialize_with = "lenient_string")]
    pub license_no: Option<String>,
    #[serde(rename = "licstatus", default, deserialize_with = "lenient_string")]
    pub license_status: Option<String>,
    #[serde(rename = "licensecat", default, deserialize_with = "lenient_string")]
    pub license_category: Option<String>,
    #[serde(rename = "issdttm", default, deserialize_with = "lenient_string")]
    pub license_issued: Option<String>,
    #[serde(rename = "expdttm", default, deserialize_with = "lenient_string")]
    pub license_expires: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub result: Option<String>,
    #[serde(rename = "resultdttm", default, deserialize_with = "lenient_string")]
    pub result_timestamp: Option<String>,
    #[serde(rename = "violation", default, deserialize_with = "lenient_string")]
    pub violation_code: Option<String>,
    #[serde(rename = "viol_level", default, deserialize_with = "lenient_string")]
    pub violation_level: Option<String>,
    #[serde(rename = "violdesc", default, deserialize_with = "lenient_string")]
    pub violation_description: Option<String>,
    #[serde(rename = "violdttm", default, deserialize_with = "lenient_string")]
    pub violation_timestamp: Option<String>,
    #[serde(rename = "viol_status", default, deserialize_with = "lenient_string")]
    pub violation_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub comments: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub zip: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub property_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => text_or_none(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse the feed's timestamp formats (`2024-03-01 10:30:00`,
/// `2024-03-01T10:30:00.000`, bare dates).
pub fn parse_source_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Deterministic natural key: business name + result timestamp + violation code.
///
/// Parts are trimmed, the timestamp is normalized when it parses, and the
/// joined text is hashed so the key length does not depend on the inputs.
pub fn inspection_key(
    business_name: Option<&str>,
    result_timestamp: Option<&str>,
    violation_code: Option<&str>,
) -> String {
    let business = business_name.map(str::trim).unwrap_or_default();
    let timestamp = result_timestamp
        .map(|raw| match parse_source_timestamp(raw) {
            Some(ts) => ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => raw.trim().to_string(),
        })
        .unwrap_or_default();
    let violation = violation_code.map(str::trim).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(business.as_bytes());
    hasher.update([0x1f]);
    hasher.update(timestamp.as_bytes());
    hasher.update([0x1f]);
    hasher.update(violation.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistable form of an [`InspectionRecord`] with derived fields resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRow {
    pub inspection_key: String,
    pub business_name: Option<String>,
    pub dba_name: Option<String>,
    pub legal_owner: Option<String>,
    pub license_no: Option<String>,
    pub license_status: Option<String>,
    pub license_category: Option<String>,
    pub license_issued_at: Option<NaiveDateTime>,
    pub license_expires_at: Option<NaiveDateTime>,
    pub result: Option<String>,
    pub result_at: Option<NaiveDateTime>,
    pub violation_code: Option<String>,
    pub violation_level: Option<String>,
    pub violation_description: Option<String>,
    pub violation_at: Option<NaiveDateTime>,
    pub violation_status: Option<String>,
    pub comments: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub property_id: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl InspectionRow {
    pub fn from_record(record: &InspectionRecord) -> Self {
        let ts = |raw: &Option<String>| raw.as_deref().and_then(parse_source_timestamp);
        Self {
            inspection_key: inspection_key(
                record.business_name.as_deref(),
                record.result_timestamp.as_deref(),
                record.violation_code.as_deref(),
            ),
            business_name: record.business_name.clone(),
            dba_name: record.dba_name.clone(),
            legal_owner: record.legal_owner.clone(),
            license_no: record.license_no.clone(),
            license_status: record.license_status.clone(),
            license_category: record.license_category.clone(),
            license_issued_at: ts(&record.license_issued),
            license_expires_at: ts(&record.license_expires),
            result: record.result.clone(),
            result_at: ts(&record.result_timestamp),
            violation_code: record.violation_code.clone(),
            violation_level: record.violation_level.clone(),
            violation_description: record.violation_description.clone(),
            violation_at: ts(&record.violation_timestamp),
            violation_status: record.violation_status.clone(),
            comments: record.comments.clone(),
            address: record.address.clone(),
            city: record.city.clone(),
            state: record.state.clone(),
            zip: record.zip.clone(),
            property_id: record.property_id.clone(),
            coordinates: parse_coordinates(record.location.as_deref()),
        }
    }

    /// True when every field the upsert is allowed to change already matches.
    pub fn same_mutable_fields(&self, other: &InspectionRow) -> bool {
        self.result == other.result
            && self.license_status == other.license_status
            && self.violation_level == other.violation_level
            && self.violation_description == other.violation_description
            && self.violation_at == other.violation_at
            && self.violation_status == other.violation_status
            && self.comments == other.comments
            && self.coordinates == other.coordinates
    }

    pub fn apply_mutable_fields(&mut self, from: &InspectionRow) {
        self.result = from.result.clone();
        self.license_status = from.license_status.clone();
        self.violation_level = from.violation_level.clone();
        self.violation_description = from.violation_description.clone();
        self.violation_at = from.violation_at;
        self.violation_status = from.violation_status.clone();
        self.comments = from.comments.clone();
        self.coordinates = from.coordinates;
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.longitude)
    }
}

/// A stored row with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInspection {
    #[serde(flatten)]
    pub row: InspectionRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotStarted => "not_started",
            SyncState::Running => "running",
            SyncState::Succeeded => "succeeded",
            SyncState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Succeeded | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(SyncState::NotStarted),
            "running" => Ok(SyncState::Running),
            "succeeded" => Ok(SyncState::Succeeded),
            "failed" => Ok(SyncState::Failed),
            other => Err(TransitionError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("sync run cannot move from {from} to {to}")]
    Invalid { from: SyncState, to: SyncState },
    #[error("unknown sync state {0:?}")]
    UnknownState(String),
}

/// Running totals for a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl RunCounts {
    pub fn synced(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Metadata for one invocation of the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub source: String,
    pub days_back: u32,
    pub cutoff: NaiveDate,
    pub state: SyncState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub error_detail: Option<String>,
}

impl SyncRun {
    pub fn new(source: impl Into<String>, days_back: u32, cutoff: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            days_back,
            cutoff,
            state: SyncState::NotStarted,
            started_at: None,
            finished_at: None,
            counts: RunCounts::default(),
            error_detail: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(SyncState::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn succeed(&mut self, counts: RunCounts, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(SyncState::Succeeded)?;
        self.counts = counts;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Partial counts are kept so operators can see how far the run got.
    pub fn fail(
        &mut self,
        counts: RunCounts,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(SyncState::Failed)?;
        self.counts = counts;
        self.error_detail = Some(detail.into());
        self.finished_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, to: SyncState) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.state, to),
            (SyncState::NotStarted, SyncState::Running)
                | (SyncState::Running, SyncState::Succeeded)
                | (SyncState::Running, SyncState::Failed)
        );
        if !allowed {
            return Err(TransitionError::Invalid { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}
