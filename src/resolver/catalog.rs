// src/resolver/catalog.rs
//! Store catalog APIs: the cheapest, most structured cascade step, only for
//! stores we recognise.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use super::ProductDraft;
use crate::config::CATALOG_API;
use crate::error::{ExtractError, ExtractResult};
use crate::limiter::{Priority, RateLimiterService};

#[async_trait]
pub trait CatalogApi: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, url: &Url) -> bool;
    /// `Ok(None)`: the store does not know this item.
    async fn lookup(&self, url: &Url) -> ExtractResult<Option<ProductDraft>>;
}

pub const MERCADO_LIVRE_API: &str = "https://api.mercadolibre.com";

/// Mercado Livre public items API (`MLB` item ids).
pub struct MercadoLivreCatalog {
    limiter: RateLimiterService,
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MlItem {
    title: Option<String>,
    price: Option<f64>,
    original_price: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    pictures: Vec<MlPicture>,
    category_id: Option<String>,
    #[serde(default)]
    attributes: Vec<MlAttribute>,
}

#[derive(Debug, Deserialize)]
struct MlPicture {
    secure_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MlAttribute {
    id: String,
    value_name: Option<String>,
}

impl MercadoLivreCatalog {
    pub fn new(limiter: RateLimiterService) -> Self {
        Self::with_base_url(limiter, MERCADO_LIVRE_API)
    }

    pub fn with_base_url(limiter: RateLimiterService, base_url: impl Into<String>) -> Self {
        Self {
            limiter,
            http: crate::sources::http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_item(&self, id: &str) -> ExtractResult<MlItem> {
        let resp = self
            .http
            .get(format!("{}/items/{id}", self.base_url))
            .send()
            .await
            .map_err(|e| ExtractError::from_reqwest(CATALOG_API, &e))?;
        let resp = crate::sources::ensure_success(CATALOG_API, resp).await?;
        resp.json()
            .await
            .map_err(|e| ExtractError::InvalidResponse(format!("{CATALOG_API}: {e}")))
    }
}

/// `MLB-1234567890` / `MLB1234567890` anywhere in the URL → `MLB1234567890`.
pub fn mercado_livre_item_id(url: &Url) -> Option<String> {
    static RE_ID: OnceCell<Regex> = OnceCell::new();
    let re = RE_ID.get_or_init(|| Regex::new(r"(?i)\bMLB-?(\d{6,})").unwrap());
    let caps = re.captures(url.as_str())?;
    Some(format!("MLB{}", &caps[1]))
}

fn item_to_draft(item: MlItem) -> ProductDraft {
    let image_url = item
        .pictures
        .into_iter()
        .find_map(|p| p.secure_url.or(p.url))
        .or(item.thumbnail);
    let brand = item
        .attributes
        .into_iter()
        .find(|a| a.id.eq_ignore_ascii_case("BRAND"))
        .and_then(|a| a.value_name);
    let price = item.price.filter(|p| p.is_finite() && *p > 0.0);
    ProductDraft {
        name: item.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        price,
        original_price: item
            .original_price
            .filter(|o| price.is_some_and(|p| *o > p)),
        image_url,
        description: None,
        category: item.category_id,
        brand,
    }
}

#[async_trait]
impl CatalogApi for MercadoLivreCatalog {
    fn name(&self) -> &'static str {
        "mercado-livre"
    }

    fn supports(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default();
        (host.contains("mercadolivre.com") || host.contains("mercadolibre.com"))
            && mercado_livre_item_id(url).is_some()
    }

    async fn lookup(&self, url: &Url) -> ExtractResult<Option<ProductDraft>> {
        let Some(id) = mercado_livre_item_id(url) else {
            return Ok(None);
        };
        let id = id.as_str();
        match self
            .limiter
            .execute(CATALOG_API, Priority::High, || self.fetch_item(id))
            .await
        {
            Ok(item) => Ok(Some(item_to_draft(item))),
            Err(ExtractError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
