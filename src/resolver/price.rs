// src/resolver/price.rs
//! Price text → number. Handles Brazilian (`R$ 1.234,56`) and US
//! (`$1,234.56`) grouping as well as bare numbers.

use serde_json::Value;

/// Parse a price string. Returns `None` unless the result is a positive, finite number.
pub fn parse_price(raw: &str) -> Option<f64> {
    // Keep the first run that contains digits and separators.
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let body: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | ' ' | '\u{a0}'))
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ','))
        .collect();
    let body = body.trim_end_matches(['.', ',']);

    let last_dot = body.rfind('.');
    let last_comma = body.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            if c > d {
                // 1.234,56
                body.replace('.', "").replace(',', ".")
            } else {
                // 1,234.56
                body.replace(',', "")
            }
        }
        (None, Some(_)) => decimal_or_grouping(body, ','),
        (Some(_), None) => decimal_or_grouping(body, '.'),
        (None, None) => body.to_string(),
    };

    let v: f64 = normalized.parse().ok()?;
    (v.is_finite() && v > 0.0).then_some(v)
}

/// A lone separator followed by exactly three digits is grouping (`1.299`);
/// anything else with one separator is a decimal mark.
fn decimal_or_grouping(body: &str, sep: char) -> String {
    let parts: Vec<&str> = body.split(sep).collect();
    let grouping = parts.len() > 2 || parts.last().is_some_and(|tail| tail.len() == 3);
    if grouping {
        parts.concat()
    } else {
        body.replace(sep, ".")
    }
}

/// Price from a JSON value (number or string).
pub fn price_from_json(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|p| p.is_finite() && *p > 0.0),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}
