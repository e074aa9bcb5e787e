// src/sources/crawl.rs
//! Crawl service (Firecrawl-style `/scrape` API). Returns rendered HTML.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{PageBackend, ScrapedPage};
use crate::config::CRAWL_SERVICE;
use crate::error::{ExtractError, ExtractResult};
use crate::limiter::{Priority, RateLimiterService};

pub const DEFAULT_CRAWL_URL: &str = "https://api.firecrawl.dev/v1/scrape";

pub struct CrawlService {
    limiter: RateLimiterService,
    http: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CrawlResponse {
    #[serde(default)]
    success: bool,
    data: Option<CrawlData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrawlData {
    html: Option<String>,
    raw_html: Option<String>,
    metadata: Option<CrawlMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrawlMetadata {
    title: Option<String>,
    #[serde(rename = "sourceURL")]
    source_url: Option<String>,
    url: Option<String>,
}

impl CrawlService {
    pub fn from_env(limiter: RateLimiterService) -> Self {
        let endpoint =
            super::env_key("CRAWL_API_URL").unwrap_or_else(|| DEFAULT_CRAWL_URL.to_string());
        Self::new(limiter, super::env_key("CRAWL_API_KEY"), endpoint)
    }

    pub fn new(limiter: RateLimiterService, api_key: Option<String>, endpoint: impl Into<String>) -> Self {
        Self {
            limiter,
            http: super::http_client(),
            api_key,
            endpoint: endpoint.into(),
        }
    }

    pub async fn scrape(&self, url: &str) -> ExtractResult<ScrapedPage> {
        self.scrape_with(url, Priority::Normal).await
    }

    pub async fn scrape_with(&self, url: &str, priority: Priority) -> ExtractResult<ScrapedPage> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(ExtractError::MissingCredentials {
                provider: CRAWL_SERVICE.into(),
            });
        };
        let page = self
            .limiter
            .execute(CRAWL_SERVICE, priority, || self.call(key, url))
            .await?;
        debug!(url, bytes = page.html.len(), "crawl service returned page");
        Ok(page)
    }

    async fn call(&self, key: &str, url: &str) -> ExtractResult<ScrapedPage> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&json!({ "url": url, "formats": ["html"], "onlyMainContent": false }))
            .send()
            .await
            .map_err(|e| ExtractError::from_reqwest(CRAWL_SERVICE, &e))?;

        let status = resp.status().as_u16();
        if status == 402 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractError::InsufficientCredits(body));
        }
        let resp = super::ensure_success(CRAWL_SERVICE, resp).await?;
        let body: CrawlResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::InvalidResponse(format!("{CRAWL_SERVICE}: {e}")))?;
        interpret(url, body)
    }
}

/// Validate a decoded scrape payload.
pub(crate) fn interpret(url: &str, body: CrawlResponse) -> ExtractResult<ScrapedPage> {
    if !body.success {
        let msg = body.error.unwrap_or_else(|| "success=false".into());
        return Err(ExtractError::from_message(&msg)
            .unwrap_or(ExtractError::InvalidResponse(format!("{CRAWL_SERVICE}: {msg}"))));
    }
    let data = body
        .data
        .ok_or_else(|| ExtractError::InvalidResponse(format!("{CRAWL_SERVICE}: missing data")))?;
    let html = data
        .html
        .or(data.raw_html)
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| ExtractError::InvalidResponse(format!("{CRAWL_SERVICE}: empty html")))?;

    let (title, final_url) = match data.metadata {
        Some(m) => (m.title, m.url.or(m.source_url)),
        None => (None, None),
    };
    let mut page = ScrapedPage::new(html, final_url.unwrap_or_else(|| url.to_string()));
    if title.is_some() {
        page.title = title;
    }
    Ok(page)
}

#[async_trait]
impl PageBackend for CrawlService {
    async fn fetch_page(&self, url: &str) -> ExtractResult<ScrapedPage> {
        self.scrape(url).await
    }

    fn name(&self) -> &'static str {
        CRAWL_SERVICE
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}
