// src/resolver/mod.rs
//! Multi-source product resolver.
//!
//! Cascade, first adequate result wins:
//! 1. store catalog API (recognised stores only)
//! 2. embedded structured data (JSON-LD, meta tags)
//! 3. AI extraction over a cleaned snippet (only when 2 is incomplete)
//! 4. heuristic CSS selectors
//!
//! Step failures are logged and skipped. Total failure returns a draft
//! flagged `needs_manual_input`; only a malformed URL is an error.

pub mod catalog;
pub mod heuristic;
pub mod html;
pub mod price;
pub mod store;
pub mod structured;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ExtractError, ExtractResult};
use crate::limiter::RateLimiterService;
use crate::sources::{AiExtractor, CrawlService, DirectFetcher, HeadlessBrowser, PageBackend, ScrapedPage};

use catalog::{CatalogApi, MercadoLivreCatalog};

/// Plausible product-name length, in chars.
const NAME_MIN_CHARS: usize = 3;
const NAME_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    CatalogApi,
    StructuredData,
    Ai,
    Heuristic,
    Manual,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::CatalogApi => "catalog_api",
            ExtractionMethod::StructuredData => "structured_data",
            ExtractionMethod::Ai => "ai",
            ExtractionMethod::Heuristic => "heuristic",
            ExtractionMethod::Manual => "manual",
        }
    }
}

/// Partial product as produced by one cascade step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductDraft {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
}

impl ProductDraft {
    pub fn has_plausible_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| {
            let len = n.trim().chars().count();
            (NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len)
        })
    }

    pub fn has_price(&self) -> bool {
        self.price.is_some_and(|p| p.is_finite() && p > 0.0)
    }

    pub fn is_adequate(&self, accept_missing_price: bool) -> bool {
        self.has_plausible_name() && (accept_missing_price || self.has_price())
    }

    /// Copy fields that are still empty here from `other`.
    pub fn fill_gaps_from(&mut self, other: &ProductDraft) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        if !self.has_plausible_name() && other.has_plausible_name() {
            self.name.clone_from(&other.name);
        }
        if !self.has_price() && other.has_price() {
            self.price = other.price;
        }
        fill(&mut self.original_price, &other.original_price);
        fill(&mut self.image_url, &other.image_url);
        fill(&mut self.description, &other.description);
        fill(&mut self.category, &other.category);
        fill(&mut self.brand, &other.brand);
    }

    fn merged_over(mut self, earlier: &ProductDraft) -> ProductDraft {
        self.fill_gaps_from(earlier);
        self
    }
}

/// What callers get back. `needs_manual_input` is success-with-caveats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProduct {
    pub name: String,
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub extraction_method: ExtractionMethod,
    pub needs_manual_input: bool,
}

/// AI step as the resolver needs it.
#[async_trait]
pub trait ProductAi: Send + Sync {
    fn is_available(&self) -> bool;
    async fn extract(&self, url: &str, html: &str) -> ExtractResult<ProductDraft>;
}

#[async_trait]
impl ProductAi for AiExtractor {
    fn is_available(&self) -> bool {
        AiExtractor::is_available(self)
    }

    async fn extract(&self, url: &str, html: &str) -> ExtractResult<ProductDraft> {
        self.extract_product(url, html).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResolverOptions {
    /// Treat a plausible name without a price as adequate.
    #[serde(default)]
    pub accept_missing_price: bool,
}

#[derive(Default)]
pub struct ProductResolver {
    catalogs: Vec<Arc<dyn CatalogApi>>,
    fetchers: Vec<Arc<dyn PageBackend>>,
    ai: Option<Arc<dyn ProductAi>>,
    options: ResolverOptions,
}

impl ProductResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production wiring: Mercado Livre catalog, direct → crawl → browser
    /// fetch chain, Gemini extractor. Sources without keys are skipped at
    /// resolve time.
    pub fn from_env(limiter: &RateLimiterService) -> Self {
        let resolver = Self::new()
            .with_catalog(Arc::new(MercadoLivreCatalog::new(limiter.clone())))
            .with_fetcher(Arc::new(DirectFetcher::new()))
            .with_fetcher(Arc::new(CrawlService::from_env(limiter.clone())))
            .with_fetcher(Arc::new(HeadlessBrowser::from_env(limiter.clone())))
            .with_ai(Arc::new(AiExtractor::from_env(limiter.clone())));
        let available: Vec<&'static str> = resolver
            .fetchers
            .iter()
            .filter(|f| f.is_available())
            .map(|f| f.name())
            .collect();
        info!(
            target: "resolver",
            fetchers = ?available,
            ai = resolver.ai.as_ref().is_some_and(|a| a.is_available()),
            "product resolver ready"
        );
        resolver
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogApi>) -> Self {
        self.catalogs.push(catalog);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageBackend>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn ProductAi>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ResolverOptions {
        self.options
    }

    pub async fn resolve(&self, raw_url: &str) -> ExtractResult<ResolvedProduct> {
        self.resolve_with(raw_url, self.options).await
    }

    pub async fn resolve_with(&self, raw_url: &str, options: ResolverOptions) -> ExtractResult<ResolvedProduct> {
        let url = validate_url(raw_url)?;
        let store = store::store_name(&url);
        let accept = options.accept_missing_price;
        let mut partial = ProductDraft::default();

        // 1. catalog
        for api in self.catalogs.iter().filter(|c| c.supports(&url)) {
            match api.lookup(&url).await {
                Ok(Some(draft)) => {
                    let draft = draft.merged_over(&partial);
                    if draft.is_adequate(accept) {
                        note_step("catalog_api", "hit");
                        return Ok(finish(draft, store, ExtractionMethod::CatalogApi));
                    }
                    note_step("catalog_api", "incomplete");
                    partial = draft;
                }
                Ok(None) => note_step("catalog_api", "miss"),
                Err(e) => {
                    note_step("catalog_api", e.kind());
                    warn!(target: "resolver", catalog = api.name(), url = %url, error = %e, "catalog lookup failed");
                }
            }
        }

        let Some(page) = self.fetch_page(url.as_str()).await else {
            return Ok(manual(partial, &url, store));
        };
        let base = Url::parse(&page.final_url).unwrap_or_else(|_| url.clone());

        // 2. structured data
        let structured = structured::extract(&page.html, &base).merged_over(&partial);
        if structured.is_adequate(accept) {
            note_step("structured_data", "hit");
            return Ok(finish(structured, store, ExtractionMethod::StructuredData));
        }
        note_step("structured_data", "incomplete");

        // 3. AI, only when configured
        let mut best = structured;
        if let Some(ai) = self.ai.as_ref().filter(|a| a.is_available()) {
            match ai.extract(url.as_str(), &page.html).await {
                Ok(draft) => {
                    let draft = draft.merged_over(&best);
                    if draft.is_adequate(accept) {
                        note_step("ai", "hit");
                        return Ok(finish(draft, store, ExtractionMethod::Ai));
                    }
                    note_step("ai", "incomplete");
                    best = draft;
                }
                Err(e) => {
                    note_step("ai", e.kind());
                    warn!(target: "resolver", url = %url, error = %e, "ai extraction failed");
                }
            }
        } else {
            debug!(target: "resolver", "ai extractor unavailable, skipping");
        }

        // 4. heuristics
        let heur = heuristic::extract(&page.html, &base).merged_over(&best);
        if heur.is_adequate(accept) {
            note_step("heuristic", "hit");
            return Ok(finish(heur, store, ExtractionMethod::Heuristic));
        }
        note_step("heuristic", "incomplete");

        Ok(manual(heur, &url, store))
    }

    /// First backend that yields HTML wins.
    async fn fetch_page(&self, url: &str) -> Option<ScrapedPage> {
        for fetcher in self.fetchers.iter().filter(|f| f.is_available()) {
            match fetcher.fetch_page(url).await {
                Ok(page) => {
                    debug!(target: "resolver", fetcher = fetcher.name(), bytes = page.html.len(), "page fetched");
                    note_step(fetcher.name(), "hit");
                    return Some(page);
                }
                Err(e) => {
                    note_step(fetcher.name(), e.kind());
                    warn!(target: "resolver", fetcher = fetcher.name(), url, error = %e, "page fetch failed");
                }
            }
        }
        None
    }
}

fn note_step(step: &str, outcome: &'static str) {
    counter!("extract_resolver_steps_total", "step" => step.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Only absolute http(s) URLs with a host.
pub fn validate_url(raw: &str) -> ExtractResult<Url> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| ExtractError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ExtractError::InvalidUrl(format!(
            "{trimmed}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ExtractError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(url)
}

fn finish(draft: ProductDraft, store: String, method: ExtractionMethod) -> ResolvedProduct {
    info!(target: "resolver", method = method.as_str(), store = %store, "product resolved");
    ResolvedProduct {
        name: draft.name.map(|n| n.trim().to_string()).unwrap_or_default(),
        price: draft.price,
        original_price: draft.original_price,
        image_url: draft.image_url,
        store,
        description: draft.description,
        category: draft.category,
        brand: draft.brand,
        extraction_method: method,
        needs_manual_input: false,
    }
}

fn manual(draft: ProductDraft, url: &Url, store: String) -> ResolvedProduct {
    warn!(target: "resolver", url = %url, "all extraction steps failed, manual input needed");
    let plausible = draft.has_plausible_name();
    let name = draft
        .name
        .filter(|_| plausible)
        .or_else(|| name_from_slug(url))
        .unwrap_or_else(|| format!("Product from {store}"));
    ResolvedProduct {
        name,
        price: draft.price,
        original_price: draft.original_price,
        image_url: draft.image_url,
        store,
        description: draft.description,
        category: draft.category,
        brand: draft.brand,
        extraction_method: ExtractionMethod::Manual,
        needs_manual_input: true,
    }
}

/// "/tenis-nike-air-max-90/p/123" → "Tenis nike air max 90".
pub fn name_from_slug(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|s| s.chars().filter(|c| c.is_alphabetic()).count() >= 3)
        .filter(|s| s.contains(['-', '_']))
        .max_by_key(|s| s.len())?;
    let segment = segment.split('.').next().unwrap_or(segment);
    // Mercado Livre listing suffix
    let segment = segment.trim_end_matches("_JM");
    let words: Vec<&str> = segment
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()) || w.len() < 5)
        .filter(|w| !w.eq_ignore_ascii_case("MLB"))
        .collect();
    let joined = words.join(" ");
    let mut chars = joined.chars();
    let first = chars.next()?;
    let name: String = first.to_uppercase().chain(chars).collect();
    (name.chars().count() >= NAME_MIN_CHARS).then_some(name)
}
