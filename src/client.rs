//! Remote usage client
//!
//! Thin wrapper over the organization usage, costs and projects endpoints.
//! Pagination is followed transparently; nothing is retried here, the next
//! scheduled cycle is the retry.

use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::ApiConfig;
use crate::models::{CostBucket, Page, Project, ResourceType, UsageBucket};
use crate::resolver::ProjectLookup;

const USAGE_BUCKET_WIDTH: &str = "1m";
/// Width of one usage bucket in seconds, matching [`USAGE_BUCKET_WIDTH`].
pub const USAGE_BUCKET_SECS: i64 = 60;
const COST_BUCKET_WIDTH: &str = "1d";
const COST_GROUP_BY: &str = "project_id,line_item";
const COST_PAGE_LIMIT: u32 = 180;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid client configuration: {0}")]
    Config(String),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// HTTP client for the organization API. Cheap to clone.
#[derive(Clone)]
pub struct UsageClient {
    http: reqwest::Client,
    base_url: String,
    page_limit: u32,
}

impl UsageClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.secret_key))
            .map_err(|_| ClientError::Config("API key is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(
            "OpenAI-Organization",
            HeaderValue::from_str(&config.organization_id)
                .map_err(|_| ClientError::Config("organization id is not a valid header value".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("openai-usage-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ClientError::Transport {
                url: config.base_url.clone(),
                source,
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_limit: config.page_limit,
        })
    }

    /// Lazily fetch usage pages for `resource` covering `[start, end)`.
    ///
    /// Each item is one decoded page of buckets, in upstream order. The stream
    /// ends after the page that reports `has_more: false`, and stops at the
    /// first error.
    pub fn usage_pages(
        &self,
        resource: ResourceType,
        start: i64,
        end: i64,
    ) -> impl Stream<Item = Result<Vec<UsageBucket>>> + '_ {
        let url = format!("{}/organization/usage/{}", self.base_url, resource.as_str());
        let group_by = resource.group_by().join(",");

        paginate(move |cursor: Option<String>| {
            let mut query: Vec<(&str, String)> = vec![
                ("start_time", start.to_string()),
                ("end_time", end.to_string()),
                ("bucket_width", USAGE_BUCKET_WIDTH.to_string()),
                ("group_by", group_by.clone()),
                ("limit", self.page_limit.to_string()),
            ];
            if let Some(page) = cursor {
                query.push(("page", page));
            }
            self.get_json::<Page<UsageBucket>>(url.clone(), query)
        })
    }

    /// All usage buckets for `resource` in `[start, end)`.
    #[instrument(skip(self))]
    pub async fn fetch_usage(
        &self,
        resource: ResourceType,
        start: i64,
        end: i64,
    ) -> Result<Vec<UsageBucket>> {
        let pages: Vec<Vec<UsageBucket>> = self.usage_pages(resource, start, end).try_collect().await?;
        Ok(pages.into_iter().flatten().collect())
    }

    /// Day-granularity cost buckets grouped by project and line item.
    #[instrument(skip(self))]
    pub async fn fetch_costs(&self, start: i64, end: i64) -> Result<Vec<CostBucket>> {
        let url = format!("{}/organization/costs", self.base_url);

        let pages: Vec<Vec<CostBucket>> = paginate(move |cursor: Option<String>| {
            let mut query: Vec<(&str, String)> = vec![
                ("start_time", start.to_string()),
                ("end_time", end.to_string()),
                ("bucket_width", COST_BUCKET_WIDTH.to_string()),
                ("group_by", COST_GROUP_BY.to_string()),
                ("limit", COST_PAGE_LIMIT.to_string()),
            ];
            if let Some(page) = cursor {
                query.push(("page", page));
            }
            self.get_json::<Page<CostBucket>>(url.clone(), query)
        })
        .try_collect()
        .await?;

        Ok(pages.into_iter().flatten().collect())
    }

    /// Look up a project by id.
    pub async fn fetch_project(&self, project_id: &str) -> Result<Project> {
        let url = format!("{}/organization/projects/{}", self.base_url, project_id);
        self.get_json(url, Vec::new()).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        query: Vec<(&str, String)>,
    ) -> Result<T> {
        debug!(url = %url, query = ?query, "Requesting");

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|source| ClientError::Decode { url, source })
    }
}

#[async_trait]
impl ProjectLookup for UsageClient {
    async fn project_name(&self, project_id: &str) -> anyhow::Result<String> {
        Ok(self.fetch_project(project_id).await?.name)
    }
}

enum Cursor {
    First,
    Next(String),
    Done,
}

/// Drive a page-fetching closure until upstream reports no more pages.
fn paginate<'a, T, F, Fut>(fetch: F) -> impl Stream<Item = Result<Vec<T>>> + 'a
where
    T: 'a,
    F: Fn(Option<String>) -> Fut + 'a,
    Fut: std::future::Future<Output = Result<Page<T>>> + 'a,
{
    stream::try_unfold((Cursor::First, fetch), |(cursor, fetch)| async move {
        let page = match cursor {
            Cursor::Done => return Ok::<_, ClientError>(None),
            Cursor::First => fetch(None).await?,
            Cursor::Next(token) => fetch(Some(token)).await?,
        };

        let next = match (page.has_more, page.next_page) {
            (true, Some(token)) if !token.is_empty() => Cursor::Next(token),
            _ => Cursor::Done,
        };

        Ok(Some((page.data, (next, fetch))))
    })
}
