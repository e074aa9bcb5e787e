// src/resolver/heuristic.rs
//! Last-resort DOM scraping: per-store CSS selectors, then generic ones,
//! then a currency regex sweep over the visible text.

use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::price::parse_price;
use super::structured::absolutize;
use super::ProductDraft;

const TITLE_SELECTORS: &[&str] = &[
    "#productTitle",
    "h1.ui-pdp-title",
    "h1[data-testid='heading-product-title']",
    "h1[itemprop='name']",
    "[itemprop='name']",
    "h1.product-title",
    "h1.product-name",
    "h1",
];

const PRICE_SELECTORS: &[&str] = &[
    "[itemprop='price']",
    "#corePrice_feature_div .a-offscreen",
    ".a-price .a-offscreen",
    ".ui-pdp-price__second-line .andes-money-amount",
    "[data-testid='price-value']",
    ".finalPrice",
    ".price-current",
    ".product-price",
    ".sales-price",
    ".price",
];

const ORIGINAL_PRICE_SELECTORS: &[&str] = &[
    ".a-text-price .a-offscreen",
    ".andes-money-amount--previous",
    "[data-testid='price-original']",
    ".price-old",
    ".old-price",
    "del",
    "s",
];

const IMAGE_SELECTORS: &[&str] = &[
    "#landingImage",
    "img.ui-pdp-image",
    "img[itemprop='image']",
    "img[data-testid='image-selected-thumbnail']",
    ".product-image img",
    "main img",
];

const BRAND_SELECTORS: &[&str] = &["#bylineInfo", "[itemprop='brand']", ".product-brand"];

pub fn extract(html: &str, base: &Url) -> ProductDraft {
    let doc = Html::parse_document(html);

    let name = first_text(&doc, TITLE_SELECTORS)
        .filter(|t| t.chars().count() >= 3)
        .or_else(|| first_text(&doc, &["title"]).map(|t| strip_site_suffix(&t)));

    let price = first_price(&doc, PRICE_SELECTORS).or_else(|| currency_sweep(&doc));
    let original_price =
        first_price(&doc, ORIGINAL_PRICE_SELECTORS).filter(|o| price.is_some_and(|p| *o > p));

    let image_url = IMAGE_SELECTORS.iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        doc.select(&sel).find_map(|img| {
            let v = img.value();
            v.attr("data-old-hires")
                .or_else(|| v.attr("data-src"))
                .or_else(|| v.attr("src"))
                .and_then(|u| absolutize(base, u))
        })
    });

    ProductDraft {
        name,
        price,
        original_price,
        image_url,
        description: None,
        category: None,
        brand: first_text(&doc, BRAND_SELECTORS),
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(doc: &Html, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        doc.select(&sel)
            .map(|el| element_text(&el))
            .find(|t| !t.is_empty())
    })
}

fn first_price(doc: &Html, selectors: &[&str]) -> Option<f64> {
    selectors.iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        doc.select(&sel).find_map(|el| {
            el.value()
                .attr("content")
                .and_then(parse_price)
                .or_else(|| parse_price(&element_text(&el)))
        })
    })
}

/// First currency-looking amount in the body text.
fn currency_sweep(doc: &Html) -> Option<f64> {
    static RE_PRICE: OnceCell<Regex> = OnceCell::new();
    let re = RE_PRICE.get_or_init(|| {
        Regex::new(r"(?:R\$|US\$|\$|€|£)\s?\d{1,3}(?:[.,\s]\d{3})*(?:[.,]\d{2})?").unwrap()
    });
    let body = Selector::parse("body").ok()?;
    let text = doc
        .select(&body)
        .next()
        .map(|b| element_text(&b))
        .unwrap_or_default();
    re.find_iter(&text).find_map(|m| parse_price(m.as_str()))
}

/// "Nome do Produto | Loja" → "Nome do Produto".
fn strip_site_suffix(title: &str) -> String {
    let cut = [" | ", " - ", " – "]
        .iter()
        .filter_map(|sep| title.find(sep))
        .min()
        .unwrap_or(title.len());
    title[..cut].trim().to_string()
}
