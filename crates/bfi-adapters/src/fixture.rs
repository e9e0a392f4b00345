//! Offline source backed by a captured `datastore_search_sql` response.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use bfi_core::{parse_source_timestamp, InspectionRecord};
use bfi_storage::FetchError;

use crate::{decode_envelope, FetchedPage, InspectionSource, PageQuery};

/// Serves pages out of records held in memory, applying the same cutoff
/// filter the remote query does.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    name: String,
    records: Vec<InspectionRecord>,
}

impl FixtureSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref();
        let fixture_error = |message: String| FetchError::Fixture {
            path: path.display().to_string(),
            message,
        };
        let body = fs::read(path).map_err(|e| fixture_error(e.to_string()))?;
        let page = decode_envelope(&body, &path.display().to_string(), 1)?;
        if page.records.is_empty() {
            return Err(fixture_error("envelope holds no records".to_string()));
        }
        Ok(Self {
            name: format!("fixture:{}", path.display()),
            records: page.records,
        })
    }

    pub fn from_records(name: impl Into<String>, records: Vec<InspectionRecord>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl InspectionSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<FetchedPage, FetchError> {
        let Some(cutoff) = query.cutoff.and_hms_opt(0, 0, 0) else {
            return Ok(FetchedPage { records: Vec::new(), total: Some(0) });
        };
        let in_window = self
            .records
            .iter()
            .filter(|r| {
                r.result_timestamp
                    .as_deref()
                    .and_then(parse_source_timestamp)
                    .is_some_and(|ts| ts >= cutoff)
            })
            .collect::<Vec<_>>();

        let total = in_window.len() as u64;
        let records = in_window
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(FetchedPage {
            records,
            total: Some(total),
        })
    }
}
