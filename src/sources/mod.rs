// src/sources/mod.rs
//! Typed wrappers around the external sources.
//!
//! A wrapper builds the provider request, classifies provider failures into
//! `ExtractError`, validates the payload and hands the call to the shared
//! `RateLimiterService`. It never touches queues or circuits itself.

pub mod ai;
pub mod browser;
pub mod crawl;
pub mod direct;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractError, ExtractResult};

pub use ai::{AiExtractor, GeminiProvider, TextGenerator};
pub use browser::HeadlessBrowser;
pub use crawl::CrawlService;
pub use direct::DirectFetcher;

const USER_AGENT: &str = "wishlist-extract/0.1 (+https://github.com/wishlist-extract)";

/// Rendered HTML of a product page, as returned by any page backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub html: String,
    pub final_url: String,
    pub title: Option<String>,
}

impl ScrapedPage {
    pub fn new(html: String, final_url: impl Into<String>) -> Self {
        let title = page_title(&html);
        Self {
            html,
            final_url: final_url.into(),
            title,
        }
    }
}

/// Anything that can turn a URL into page HTML.
#[async_trait]
pub trait PageBackend: Send + Sync {
    async fn fetch_page(&self, url: &str) -> ExtractResult<ScrapedPage>;
    fn name(&self) -> &'static str;
    /// Credentials present (checked once, at construction).
    fn is_available(&self) -> bool;
}

/// Non-empty env var or `None`.
pub(crate) fn env_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// HTTP client without its own timeout; the limiter owns timeouts.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Turn a non-2xx response into a classified error.
pub(crate) async fn ensure_success(
    provider: &str,
    resp: reqwest::Response,
) -> ExtractResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ExtractError::from_status(provider, status.as_u16(), &body))
}

pub(crate) fn page_title(html: &str) -> Option<String> {
    let sel = Selector::parse("title").ok()?;
    let doc = Html::parse_document(html);
    let text = doc.select(&sel).next()?.text().collect::<String>();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}
