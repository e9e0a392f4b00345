//! Boston open-data portal (CKAN `datastore_search_sql`).

use async_trait::async_trait;
use bfi_storage::{FetchError, HttpFetcher, FEED_SOURCE};
use uuid::Uuid;

use crate::{decode_envelope, FetchedPage, InspectionSource, PageQuery};

pub const DEFAULT_CKAN_SQL_API_URL: &str =
    "https://data.boston.gov/api/3/action/datastore_search_sql";

/// Food establishment inspections dataset.
pub const DEFAULT_RESOURCE_ID: &str = "4582bec6-2b4f-4f9e-bc55-cbaa73117f4c";

#[derive(Debug)]
pub struct CkanSource {
    fetcher: HttpFetcher,
    api_url: String,
    resource_id: Uuid,
}

impl CkanSource {
    pub fn new(fetcher: HttpFetcher, api_url: impl Into<String>, resource_id: Uuid) -> Self {
        Self {
            fetcher,
            api_url: api_url.into(),
            resource_id,
        }
    }

    pub fn resource_id(&self) -> Uuid {
        self.resource_id
    }

    /// Both interpolated values are typed (a UUID and a date), so no free text
    /// reaches the remote SQL.
    pub fn page_sql(&self, query: &PageQuery) -> String {
        format!(
            r#"SELECT * FROM "{}" WHERE "resultdttm" >= '{}' ORDER BY "resultdttm" DESC, "_id" ASC LIMIT {} OFFSET {}"#,
            self.resource_id.hyphenated(),
            query.cutoff.format("%Y-%m-%d"),
            query.limit,
            query.offset,
        )
    }
}

#[async_trait]
impl InspectionSource for CkanSource {
    fn source_id(&self) -> &str {
        FEED_SOURCE
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<FetchedPage, FetchError> {
        let sql = self.page_sql(query);
        let response = self.fetcher.get(&self.api_url, &[("sql", sql)]).await?;
        let context = format!("{} offset {}", response.final_url, query.offset);
        decode_envelope(&response.body, &context, response.attempts)
    }
}
