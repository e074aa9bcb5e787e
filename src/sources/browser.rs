// src/sources/browser.rs
//! Headless browser service (Browserless-style `/content` and `/screenshot`).
//! Slowest and priciest backend; single-page fetches run at high priority.

use async_trait::async_trait;
use serde_json::json;

use super::{PageBackend, ScrapedPage};
use crate::config::HEADLESS_BROWSER;
use crate::error::{ExtractError, ExtractResult};
use crate::limiter::{Priority, RateLimiterService};

pub const DEFAULT_BROWSER_URL: &str = "https://chrome.browserless.io";

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct HeadlessBrowser {
    limiter: RateLimiterService,
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl HeadlessBrowser {
    pub fn from_env(limiter: RateLimiterService) -> Self {
        let base =
            super::env_key("BROWSER_API_URL").unwrap_or_else(|| DEFAULT_BROWSER_URL.to_string());
        Self::new(limiter, super::env_key("BROWSER_API_KEY"), base)
    }

    pub fn new(limiter: RateLimiterService, api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            limiter,
            http: super::http_client(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn key(&self) -> ExtractResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ExtractError::MissingCredentials {
                provider: HEADLESS_BROWSER.into(),
            })
    }

    /// Fully rendered HTML after network idle.
    pub async fn content(&self, url: &str) -> ExtractResult<ScrapedPage> {
        let key = self.key()?;
        self.limiter
            .execute(HEADLESS_BROWSER, Priority::High, || self.content_once(key, url))
            .await
    }

    /// Viewport PNG of the page.
    pub async fn screenshot(&self, url: &str) -> ExtractResult<Vec<u8>> {
        let key = self.key()?;
        self.limiter
            .execute(HEADLESS_BROWSER, Priority::High, || self.screenshot_once(key, url))
            .await
    }

    async fn post(&self, key: &str, path: &str, body: serde_json::Value) -> ExtractResult<reqwest::Response> {
        let resp = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractError::from_reqwest(HEADLESS_BROWSER, &e))?;
        super::ensure_success(HEADLESS_BROWSER, resp).await
    }

    async fn content_once(&self, key: &str, url: &str) -> ExtractResult<ScrapedPage> {
        let resp = self
            .post(
                key,
                "content",
                json!({ "url": url, "gotoOptions": { "waitUntil": "networkidle2" } }),
            )
            .await?;
        let html = resp
            .text()
            .await
            .map_err(|e| ExtractError::from_reqwest(HEADLESS_BROWSER, &e))?;
        validate_html(&html)?;
        Ok(ScrapedPage::new(html, url))
    }

    async fn screenshot_once(&self, key: &str, url: &str) -> ExtractResult<Vec<u8>> {
        let resp = self
            .post(
                key,
                "screenshot",
                json!({ "url": url, "options": { "type": "png", "fullPage": false } }),
            )
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ExtractError::from_reqwest(HEADLESS_BROWSER, &e))?;
        validate_png(&bytes)?;
        Ok(bytes.to_vec())
    }
}

fn validate_html(html: &str) -> ExtractResult<()> {
    let head: String = html.trim_start().chars().take(512).collect::<String>().to_ascii_lowercase();
    let looks_like_html =
        head.contains("<html") || head.contains("<!doctype") || head.contains("<body");
    if !looks_like_html {
        return Err(ExtractError::InvalidResponse(format!(
            "{HEADLESS_BROWSER}: response is not an html document"
        )));
    }
    Ok(())
}

fn validate_png(bytes: &[u8]) -> ExtractResult<()> {
    if bytes.starts_with(PNG_MAGIC) {
        Ok(())
    } else {
        Err(ExtractError::InvalidResponse(format!(
            "{HEADLESS_BROWSER}: screenshot is not a png ({} bytes)",
            bytes.len()
        )))
    }
}

#[async_trait]
impl PageBackend for HeadlessBrowser {
    async fn fetch_page(&self, url: &str) -> ExtractResult<ScrapedPage> {
        self.content(url).await
    }

    fn name(&self) -> &'static str {
        HEADLESS_BROWSER
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}
