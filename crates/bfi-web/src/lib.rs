//! Read-only JSON API over reconciled inspections.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bfi_core::StoredInspection;
use bfi_storage::{
    InspectionFilter, InspectionQueries, ResultCount, StoreError, ZipCount, FEED_SOURCE,
};
use bfi_sync::{assess_health, HealthReport, MAX_DAYS_BACK, MIN_DAYS_BACK};
use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "bfi-web";

pub const DEFAULT_DAYS: i64 = 90;
pub const DEFAULT_LIMIT: i64 = 1000;
pub const MAX_LIMIT: i64 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<dyn InspectionQueries>,
}

impl AppState {
    pub fn new(queries: Arc<dyn InspectionQueries>) -> Self {
        Self { queries }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/inspections", get(inspections_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/neighborhoods", get(neighborhoods_handler))
        .route("/api/results", get(results_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving inspections api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Store(err) => {
                error!(error = %err, "query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<i64, ApiError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ApiError::BadRequest(format!(
            "{name} must be between {min} and {max}, got {value}"
        )))
    }
}

fn window_start(days: i64) -> Result<(i64, NaiveDateTime), ApiError> {
    let days = check_range("days", days, i64::from(MIN_DAYS_BACK), i64::from(MAX_DAYS_BACK))?;
    Ok((days, Utc::now().naive_utc() - Duration::days(days)))
}

#[derive(Debug, Deserialize)]
struct InspectionsQuery {
    zip: Option<String>,
    result: Option<String>,
    days: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct InspectionsResponse {
    data: Vec<StoredInspection>,
    count: usize,
    total: u64,
    limit: i64,
    offset: i64,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn inspections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InspectionsQuery>,
) -> Result<Json<InspectionsResponse>, ApiError> {
    let (_, since) = window_start(query.days.unwrap_or(DEFAULT_DAYS))?;
    let limit = check_range("limit", query.limit.unwrap_or(DEFAULT_LIMIT), 1, MAX_LIMIT)?;
    let offset = check_range("offset", query.offset.unwrap_or(0), 0, i64::from(u32::MAX))?;

    let filter = InspectionFilter {
        zip: non_blank(query.zip),
        result: non_blank(query.result),
        since,
        limit: limit as u32,
        offset: offset as u32,
    };
    let page = state.queries.latest_inspections(&filter).await?;
    Ok(Json(InspectionsResponse {
        count: page.rows.len(),
        data: page.rows,
        total: page.total,
        limit,
        offset,
    }))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    period_days: i64,
    total_establishments: u64,
    pass_rate: f64,
    total_violations: u64,
    by_result: Vec<ResultCount>,
    by_zip: Vec<ZipCount>,
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let (days, since) = window_start(query.days.unwrap_or(DEFAULT_DAYS))?;
    let stats = state.queries.stats(since).await?;
    Ok(Json(StatsResponse {
        period_days: days,
        total_establishments: stats.total_establishments,
        pass_rate: stats.pass_rate(),
        total_violations: stats.total_violations,
        by_result: stats.by_result,
        by_zip: stats.by_zip,
    }))
}

async fn neighborhoods_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let zips = state.queries.zip_counts().await?;
    Ok(Json(json!({ "data": zips })))
}

#[derive(Debug, Serialize)]
struct ResultCode {
    code: String,
    label: String,
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let codes = state
        .queries
        .result_codes()
        .await?
        .into_iter()
        .map(|code| ResultCode { label: code.clone(), code })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": codes })))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    database: &'static str,
    #[serde(flatten)]
    report: HealthReport,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let last_run = match state.queries.ping().await {
        Ok(()) => state.queries.last_run(FEED_SOURCE).await,
        Err(err) => Err(err),
    };
    match last_run {
        Ok(last_run) => {
            let report = assess_health(last_run.as_ref(), Utc::now());
            let status = if report.is_unhealthy() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (status, Json(HealthResponse { database: "connected", report })).into_response()
        }
        Err(err) => {
            error!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "database": "error", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
