// src/sources/direct.rs
//! Plain HTTP page fetch. Free, so it goes first; anti-bot pages are
//! classified as failures so the resolver moves on to the paid backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::Html;

use super::{PageBackend, ScrapedPage};
use crate::error::{ExtractError, ExtractResult};

pub const DIRECT_FETCH: &str = "direct-fetch";

const DIRECT_TIMEOUT: Duration = Duration::from_secs(15);
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
/// Below this size a product page is almost certainly an interstitial.
const MIN_PAGE_BYTES: usize = 512;

/// Phrases an interstitial shows the visitor. Matched against visible text
/// only: ordinary pages load captcha widgets in scripts.
const BLOCK_PHRASES: &[&str] = &[
    "captcha",
    "are you a robot",
    "robot check",
    "verify you are human",
    "just a moment",
    "access denied",
    "request blocked",
];

/// Markup that only challenge pages carry.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "_cf_chl_opt",
    "cf-browser-verification",
    "id=\"challenge-form\"",
];

const VISIBLE_TEXT_CHARS: usize = 4_000;
const SIGNATURE_SCAN_CHARS: usize = 8_000;

pub struct DirectFetcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for DirectFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectFetcher {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(8))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            timeout: DIRECT_TIMEOUT,
        }
    }

    pub async fn fetch(&self, url: &str) -> ExtractResult<ScrapedPage> {
        let send = self.http.get(url).send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout))?
            .map_err(|e| ExtractError::from_reqwest(DIRECT_FETCH, &e))?;
        let final_url = resp.url().to_string();
        let resp = super::ensure_success(DIRECT_FETCH, resp).await?;
        let html = resp
            .text()
            .await
            .map_err(|e| ExtractError::from_reqwest(DIRECT_FETCH, &e))?;
        check_not_blocked(&html)?;
        Ok(ScrapedPage::new(html, final_url))
    }
}

/// Reject interstitials (captcha walls, bot checks, empty shells).
pub fn check_not_blocked(html: &str) -> ExtractResult<()> {
    if html.len() < MIN_PAGE_BYTES {
        return Err(ExtractError::InvalidResponse(format!(
            "{DIRECT_FETCH}: page too small ({} bytes)",
            html.len()
        )));
    }
    // Only the leading text counts; product copy further down may mention them.
    let visible = visible_text(html, VISIBLE_TEXT_CHARS);
    let raw: String = html
        .chars()
        .take(SIGNATURE_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();
    let marker = BLOCK_PHRASES
        .iter()
        .find(|m| visible.contains(*m))
        .or_else(|| CHALLENGE_SIGNATURES.iter().find(|m| raw.contains(*m)));
    if let Some(marker) = marker {
        return Err(ExtractError::Forbidden(format!(
            "{DIRECT_FETCH}: blocked ({marker})"
        )));
    }
    Ok(())
}

/// Lowercased text a visitor would read (title included), skipping script,
/// style and template contents.
fn visible_text(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    for node in doc.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element())
            .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"));
        if hidden {
            continue;
        }
        out.push_str(text);
        out.push(' ');
        if out.len() >= max_chars {
            break;
        }
    }
    out.to_lowercase()
}

#[async_trait]
impl PageBackend for DirectFetcher {
    async fn fetch_page(&self, url: &str) -> ExtractResult<ScrapedPage> {
        self.fetch(url).await
    }

    fn name(&self) -> &'static str {
        DIRECT_FETCH
    }

    fn is_available(&self) -> bool {
        true
    }
}
