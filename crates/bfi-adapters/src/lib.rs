//! Inspection sources: the CKAN datastore and an offline fixture, plus the
//! batch iterator the sync pipeline drives.

pub mod ckan;
pub mod fixture;

use async_trait::async_trait;
use bfi_core::InspectionRecord;
use bfi_storage::FetchError;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

pub use ckan::{CkanSource, DEFAULT_CKAN_SQL_API_URL, DEFAULT_RESOURCE_ID};
pub use fixture::FixtureSource;

pub const CRATE_NAME: &str = "bfi-adapters";

/// One window of the remote result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub cutoff: NaiveDate,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub records: Vec<InspectionRecord>,
    /// Row count of the whole result set, when the source reports one.
    pub total: Option<u64>,
}

#[async_trait]
pub trait InspectionSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, query: &PageQuery) -> Result<FetchedPage, FetchError>;
}

/// `datastore_search_sql` response envelope. Fixture files use the same shape.
#[derive(Debug, Deserialize)]
struct CkanEnvelope {
    success: bool,
    #[serde(default)]
    result: Option<CkanResult>,
    #[serde(default)]
    error: Option<CkanApiError>,
}

#[derive(Debug, Deserialize)]
struct CkanResult {
    #[serde(default)]
    records: Vec<InspectionRecord>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CkanApiError {
    #[serde(default)]
    message: Option<String>,
}

pub(crate) fn decode_envelope(
    body: &[u8],
    context: &str,
    attempts: usize,
) -> Result<FetchedPage, FetchError> {
    let envelope: CkanEnvelope =
        serde_json::from_slice(body).map_err(|source| FetchError::Decode {
            context: context.to_string(),
            attempts,
            source,
        })?;

    if !envelope.success {
        let message = envelope
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| "request was not successful".to_string());
        return Err(FetchError::Api { message, attempts });
    }

    let result = envelope.result.unwrap_or(CkanResult {
        records: Vec::new(),
        total: None,
    });
    Ok(FetchedPage {
        records: result.records,
        total: result.total,
    })
}

/// Lazy, finite walk over a source's pages for one cutoff.
///
/// Ends after an empty page, a page shorter than `page_size`, or once the
/// reported `total` is reached. A failed page ends the walk; start a new
/// iterator to try again.
pub struct InspectionBatches<'a> {
    source: &'a dyn InspectionSource,
    cutoff: NaiveDate,
    page_size: u32,
    offset: u64,
    done: bool,
}

impl<'a> InspectionBatches<'a> {
    pub fn new(source: &'a dyn InspectionSource, cutoff: NaiveDate, page_size: u32) -> Self {
        Self {
            source,
            cutoff,
            page_size: page_size.max(1),
            offset: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<InspectionRecord>>, FetchError> {
        if self.done {
            return Ok(None);
        }

        let query = PageQuery {
            cutoff: self.cutoff,
            limit: self.page_size,
            offset: self.offset,
        };
        let page = match self.source.fetch_page(&query).await {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };

        if page.records.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let len = page.records.len() as u64;
        self.offset += len;
        if len < u64::from(self.page_size) || page.total.is_some_and(|total| self.offset >= total) {
            self.done = true;
        }
        debug!(
            source = self.source.source_id(),
            offset = self.offset,
            records = len,
            "fetched inspection page"
        );
        Ok(Some(page.records))
    }
}
