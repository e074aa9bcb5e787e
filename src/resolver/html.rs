// src/resolver/html.rs
//! HTML → compact text for the AI prompt.

use once_cell::sync::OnceCell;
use regex::Regex;

/// Strip noise (scripts, styles, svg, comments, markup), keep text and image
/// sources, decode entities, collapse whitespace, cap at `max_chars`.
pub fn clean_for_ai(html: &str, max_chars: usize) -> String {
    static RE_NOISE: OnceCell<Vec<Regex>> = OnceCell::new();
    let noise = RE_NOISE.get_or_init(|| {
        [
            r"(?is)<script\b[^>]*>.*?</script>",
            r"(?is)<style\b[^>]*>.*?</style>",
            r"(?is)<noscript\b[^>]*>.*?</noscript>",
            r"(?is)<svg\b[^>]*>.*?</svg>",
            r"(?is)<iframe\b[^>]*>.*?</iframe>",
            r"(?s)<!--.*?-->",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    let mut out = html.to_string();
    for re in noise {
        out = re.replace_all(&out, " ").into_owned();
    }

    // Image sources are often the only place the product photo appears.
    static RE_IMG: OnceCell<Regex> = OnceCell::new();
    let re_img = RE_IMG.get_or_init(|| {
        Regex::new(r#"(?is)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["'][^>]*>"#).unwrap()
    });
    out = re_img
        .replace_all(&out, |caps: &regex::Captures| format!(" [img {}] ", &caps[1]))
        .into_owned();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").into_owned();

    out = html_escape::decode_html_entities(&out).into_owned();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}
