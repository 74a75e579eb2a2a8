use std::sync::LazyLock;

use regex::Regex;

/// Digits and dots only, at least one digit.
static NUMERIC_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9.]*[0-9][0-9.]*$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum PriceParse {
    Price(f64),
    /// Numeric-looking text, or the lower bound of a range, that failed to parse.
    Malformed(String),
}

/// Normalize the text of a price node into a single price.
///
/// Currency markers (`NT$`, `$`) and thousands separators are stripped. A range
/// `low~high` collapses to `low`, and a malformed lower bound is rejected.
/// Any other non-numeric text yields `0.0`.
pub fn normalize_price(raw: &str) -> PriceParse {
    let cleaned = raw
        .trim()
        .replace("NT$", "")
        .replace('$', "")
        .replace(',', "");
    let cleaned = cleaned.trim();

    if let Some((low, _)) = cleaned.split_once('~') {
        let low = low.trim();
        return match parse_literal(low) {
            Some(p) => PriceParse::Price(p),
            None => PriceParse::Malformed(low.to_string()),
        };
    }

    if !NUMERIC_LITERAL_RE.is_match(cleaned) {
        // Lenient: unpriced rows are kept with a zero price.
        return PriceParse::Price(0.0);
    }
    match parse_literal(cleaned) {
        Some(p) => PriceParse::Price(p),
        None => PriceParse::Malformed(cleaned.to_string()),
    }
}

fn parse_literal(s: &str) -> Option<f64> {
    if !NUMERIC_LITERAL_RE.is_match(s) {
        return None;
    }
    s.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}
