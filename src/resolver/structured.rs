// src/resolver/structured.rs
//! Embedded metadata extraction: JSON-LD `Product` first, then OpenGraph /
//! `product:` meta tags to fill what JSON-LD left out. No network, no AI.

use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use super::price::price_from_json;
use super::ProductDraft;

pub fn extract(html: &str, base: &Url) -> ProductDraft {
    let doc = Html::parse_document(html);
    let mut draft = json_ld(&doc, base).unwrap_or_default();
    draft.fill_gaps_from(&meta_tags(&doc, base));
    draft
}

fn json_ld(doc: &Html, base: &Url) -> Option<ProductDraft> {
    let sel = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    doc.select(&sel)
        .filter_map(|node| {
            let raw = node.text().collect::<String>();
            serde_json::from_str::<Value>(raw.trim()).ok()
        })
        .find_map(|v| find_product(&v).map(|p| product_from_node(p, base)))
}

/// Depth-first search for a node typed `Product` (top-level arrays and `@graph` included).
fn find_product(v: &Value) -> Option<&Value> {
    match v {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            if is_type(v, "Product") {
                return Some(v);
            }
            if let Some(graph) = map.get("@graph") {
                if let Some(p) = find_product(graph) {
                    return Some(p);
                }
            }
            // ItemPage / WebPage wrappers
            ["mainEntity", "itemOffered"]
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(find_product)
        }
        _ => None,
    }
}

fn is_type(v: &Value, wanted: &str) -> bool {
    match v.get("@type") {
        Some(Value::String(t)) => t.eq_ignore_ascii_case(wanted),
        Some(Value::Array(ts)) => ts
            .iter()
            .any(|t| t.as_str().is_some_and(|s| s.eq_ignore_ascii_case(wanted))),
        _ => false,
    }
}

fn product_from_node(p: &Value, base: &Url) -> ProductDraft {
    let (price, original_price) = offer_prices(p.get("offers"));
    ProductDraft {
        name: text_field(p.get("name")),
        price,
        original_price,
        image_url: image_field(p.get("image")).and_then(|u| absolutize(base, &u)),
        description: text_field(p.get("description")),
        category: text_field(p.get("category")),
        brand: p.get("brand").and_then(|b| match b {
            Value::Object(_) => text_field(b.get("name")),
            other => text_field(Some(other)),
        }),
    }
}

/// `(current, original)` from `offers` as object, array or `AggregateOffer`.
fn offer_prices(offers: Option<&Value>) -> (Option<f64>, Option<f64>) {
    let Some(offers) = offers else {
        return (None, None);
    };
    match offers {
        Value::Array(list) => list
            .iter()
            .map(|o| offer_prices(Some(o)))
            .find(|(p, _)| p.is_some())
            .unwrap_or((None, None)),
        Value::Object(_) => {
            let price = offers
                .get("price")
                .and_then(price_from_json)
                .or_else(|| offers.get("lowPrice").and_then(price_from_json))
                .or_else(|| {
                    offers
                        .get("priceSpecification")
                        .and_then(|s| s.get("price"))
                        .and_then(price_from_json)
                });
            let original = offers
                .get("highPrice")
                .filter(|_| !is_type(offers, "AggregateOffer"))
                .and_then(price_from_json)
                .filter(|o| price.is_some_and(|p| *o > p));
            if price.is_none() {
                if let Some(inner) = offers.get("offers") {
                    return offer_prices(Some(inner));
                }
            }
            (price, original)
        }
        _ => (None, None),
    }
}

fn text_field(v: Option<&Value>) -> Option<String> {
    let s = match v? {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().find_map(|i| i.as_str())?.to_string(),
        Value::Object(map) => map.get("name")?.as_str()?.to_string(),
        _ => return None,
    };
    let s = html_escape::decode_html_entities(s.trim()).into_owned();
    (!s.is_empty()).then_some(s)
}

fn image_field(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|i| image_field(Some(i))),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("contentUrl"))
            .and_then(|u| u.as_str())
            .map(str::to_string),
        _ => None,
    }
}

pub(crate) fn absolutize(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    base.join(raw).ok().map(|u| u.to_string())
}

fn meta_tags(doc: &Html, base: &Url) -> ProductDraft {
    let meta = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| {
            let css = format!(r#"meta[property="{k}"], meta[name="{k}"], meta[itemprop="{k}"]"#);
            let sel = Selector::parse(&css).ok()?;
            doc.select(&sel)
                .filter_map(|m| m.value().attr("content"))
                .map(str::trim)
                .find(|c| !c.is_empty())
                .map(str::to_string)
        })
    };

    ProductDraft {
        name: meta(&["og:title", "twitter:title"]),
        price: meta(&["product:price:amount", "og:price:amount", "price"])
            .and_then(|p| super::price::parse_price(&p)),
        original_price: meta(&["product:original_price:amount"])
            .and_then(|p| super::price::parse_price(&p)),
        image_url: meta(&["og:image", "og:image:secure_url", "twitter:image"])
            .and_then(|u| absolutize(base, &u)),
        description: meta(&["og:description", "description"]),
        category: meta(&["product:category"]),
        brand: meta(&["product:brand", "og:brand"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://loja.test/produtos/cafeteira").unwrap()
    }

    #[test]
    fn json_ld_product_in_graph_with_offer_array() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@context":"https://schema.org","@graph":[
              {"@type":"BreadcrumbList","itemListElement":[]},
              {"@type":["Product"],"name":"Cafeteira Nespresso","brand":{"@type":"Brand","name":"Nespresso"},
               "image":["/img/c.jpg"],"offers":[{"@type":"Offer","price":"549.90","priceCurrency":"BRL"}]}
            ]}</script></head><body></body></html>"#;
        let d = extract(html, &base());
        assert_eq!(d.name.as_deref(), Some("Cafeteira Nespresso"));
        assert_eq!(d.brand.as_deref(), Some("Nespresso"));
        assert_eq!(d.price, Some(549.90));
        assert_eq!(d.image_url.as_deref(), Some("https://loja.test/img/c.jpg"));
    }

    #[test]
    fn aggregate_offer_uses_low_price() {
        let html = r#"<script type="application/ld+json">
            {"@type":"Product","name":"Monitor 27","offers":{"@type":"AggregateOffer","lowPrice":1199,"highPrice":1599}}
            </script>"#;
        let d = extract(html, &base());
        assert_eq!(d.price, Some(1199.0));
        assert_eq!(d.original_price, None);
    }

    #[test]
    fn meta_tags_fill_gaps_and_broken_json_is_skipped() {
        let html = r#"<html><head>
            <script type="application/ld+json">{ not json</script>
            <script type="application/ld+json">{"@type":"Product","name":"Liquidificador"}</script>
            <meta property="og:title" content="Liquidificador Turbo | Loja">
            <meta property="product:price:amount" content="189,90">
            <meta property="og:image" content="https://cdn.test/l.png">
            </head></html>"#;
        let d = extract(html, &base());
        assert_eq!(d.name.as_deref(), Some("Liquidificador"));
        assert_eq!(d.price, Some(189.90));
        assert_eq!(d.image_url.as_deref(), Some("https://cdn.test/l.png"));
    }

    #[test]
    fn page_without_metadata_yields_empty_draft() {
        let d = extract("<html><body><h1>Nada</h1></body></html>", &base());
        assert_eq!(d, ProductDraft::default());
    }
}
