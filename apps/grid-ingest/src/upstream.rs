use crate::error::SourceError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use url::Url;

pub type SourceRecord = Map<String, JsonValue>;

/// Anything that can hand over the raw records of one ingestion window.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_window(&self, now: DateTime<Utc>) -> Result<Vec<SourceRecord>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<SourceRecord>,
}

/// Paginated client for the open-data records endpoint.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: Url,
    page_limit: usize,
    window: ChronoDuration,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(
        http: Client,
        base_url: Url,
        page_limit: usize,
        window: ChronoDuration,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url,
            page_limit: page_limit.max(1),
            window,
            request_timeout,
            retry,
        }
    }

    async fn fetch_page(&self, url: &Url) -> Result<Vec<SourceRecord>, SourceError> {
        let response = self
            .http
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| SourceError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Transient(format!("upstream returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response
            .bytes()
            .await
            .map_err(|err| SourceError::Transient(err.to_string()))?
            .to_vec();
        let page: Page = simd_json::serde::from_slice(&mut bytes)
            .map_err(|err| SourceError::Malformed(err.to_string()))?;
        Ok(page.results)
    }
}

#[async_trait]
impl RecordSource for UpstreamClient {
    async fn fetch_window(&self, now: DateTime<Utc>) -> Result<Vec<SourceRecord>, SourceError> {
        let windowed = windowed_url(&self.base_url, now - self.window);
        tracing::info!(url = %windowed, "fetching upstream window");

        let mut records = Vec::new();
        let mut offset = 0usize;
        loop {
            let page_url = paged_url(&windowed, self.page_limit, offset);
            let page = self
                .retry
                .run("upstream.page", |_| self.fetch_page(&page_url))
                .await?;
            let count = page.len();
            tracing::debug!(offset, count, total = records.len() + count, "fetched upstream page");
            records.extend(page);
            if count < self.page_limit {
                break;
            }
            offset += self.page_limit;
        }
        Ok(records)
    }
}

fn replace_query(base: &Url, replacements: &[(&str, String)]) -> Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| !replacements.iter().any(|(name, _)| key == name))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut url = base.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        pairs.extend_pairs(replacements.iter().map(|(k, v)| (*k, v.as_str())));
    }
    url
}

/// Restricts the query to records at or after `window_start`.
pub fn windowed_url(base: &Url, window_start: DateTime<Utc>) -> Url {
    let iso = window_start.to_rfc3339_opts(SecondsFormat::Secs, false);
    replace_query(base, &[("where", format!("date_heure >= '{iso}'"))])
}

pub fn paged_url(base: &Url, limit: usize, offset: usize) -> Url {
    replace_query(
        base,
        &[("limit", limit.to_string()), ("offset", offset.to_string())],
    )
}
