// src/resolver/store.rs
//! Host → store display name.

use url::Url;

const KNOWN_STORES: &[(&str, &str)] = &[
    ("amazon.", "Amazon"),
    ("amzn.", "Amazon"),
    ("mercadolivre.", "Mercado Livre"),
    ("mercadolibre.", "Mercado Libre"),
    ("magazineluiza.", "Magazine Luiza"),
    ("magalu.", "Magazine Luiza"),
    ("americanas.", "Americanas"),
    ("submarino.", "Submarino"),
    ("shoptime.", "Shoptime"),
    ("casasbahia.", "Casas Bahia"),
    ("pontofrio.", "Ponto"),
    ("extra.com", "Extra"),
    ("kabum.", "KaBuM!"),
    ("shopee.", "Shopee"),
    ("aliexpress.", "AliExpress"),
    ("netshoes.", "Netshoes"),
    ("centauro.", "Centauro"),
    ("fastshop.", "Fast Shop"),
    ("leroymerlin.", "Leroy Merlin"),
    ("ebay.", "eBay"),
    ("walmart.", "Walmart"),
    ("etsy.", "Etsy"),
];

/// Public-suffix labels skipped when guessing a name for an unknown host.
const SUFFIX_LABELS: &[&str] = &["com", "br", "net", "org", "co", "uk", "shop", "store", "online"];

pub fn store_name(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    if let Some((_, name)) = KNOWN_STORES.iter().find(|(frag, _)| {
        host.starts_with(frag) || host.contains(&format!(".{frag}"))
    }) {
        return (*name).to_string();
    }

    let label = host
        .split('.')
        .rev()
        .find(|l| !l.is_empty() && !SUFFIX_LABELS.contains(l))
        .unwrap_or(host);
    capitalize(label)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(u: &str) -> String {
        store_name(&Url::parse(u).unwrap())
    }

    #[test]
    fn known_and_unknown_hosts() {
        assert_eq!(name("https://www.amazon.com.br/dp/B0C1"), "Amazon");
        assert_eq!(name("https://produto.mercadolivre.com.br/MLB-123"), "Mercado Livre");
        assert_eq!(name("https://www.kabum.com.br/produto/1"), "KaBuM!");
        assert_eq!(name("https://loja.minhaloja.com.br/p/1"), "Minhaloja");
        assert_eq!(name("https://tenis.shop/p"), "Tenis");
    }
}
