pub mod price;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

use price::{normalize_price, PriceParse};

static ITEM_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.product-item").unwrap());
static AD_TAG_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.rt-product-card-ad-tag").unwrap());
static NAME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.rt-product-card-name-wrap").unwrap());
static PRICE_WRAP_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".rt-product-card-price-wrap").unwrap());
static PRICE_TEXT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".rt-text-price.text-price-dollar").unwrap());

const AD_MARKER: &str = "AD";

/// One priced listing scraped from a search-results page.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedListing {
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub price: f64,
    pub search_term: String,
}

/// Why a listing container did not produce a `TrackedListing`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowSkip {
    #[error("name link or price container missing")]
    MissingNameOrPrice,
    #[error("listing name is empty")]
    EmptyName,
    #[error("name link has no href")]
    MissingHref,
    #[error("price text missing for {name}")]
    MissingPriceText { name: String },
    #[error("malformed price {text:?} for {name}")]
    MalformedPrice { name: String, text: String },
    #[error("no external id in {url}")]
    MissingExternalId { url: String },
}

#[derive(Debug, Default)]
pub struct PageExtract {
    pub listings: Vec<TrackedListing>,
    pub ads: usize,
    pub skipped: Vec<RowSkip>,
}

/// True once the page has rendered at least one listing container.
pub fn has_listing_container(html: &str) -> bool {
    Html::parse_document(html).select(&ITEM_SEL).next().is_some()
}

/// Extract every genuine listing from one search-results page, in document order.
pub fn extract_listings(html: &str, search_term: &str) -> PageExtract {
    let doc = Html::parse_document(html);
    let mut out = PageExtract::default();

    for item in doc.select(&ITEM_SEL) {
        if is_ad(&item) {
            warn!(term = search_term, "Skipping AD item");
            out.ads += 1;
            continue;
        }
        match extract_one(&item, search_term) {
            Ok(listing) => out.listings.push(listing),
            Err(skip) => {
                warn!(term = search_term, reason = %skip, "Skipping listing");
                out.skipped.push(skip);
            }
        }
    }

    out
}

fn is_ad(item: &ElementRef) -> bool {
    item.select(&AD_TAG_SEL)
        .next()
        .is_some_and(|tag| element_text(&tag) == AD_MARKER)
}

fn extract_one(item: &ElementRef, search_term: &str) -> Result<TrackedListing, RowSkip> {
    let (name_tag, price_wrap) = match (
        item.select(&NAME_SEL).next(),
        item.select(&PRICE_WRAP_SEL).next(),
    ) {
        (Some(n), Some(p)) => (n, p),
        _ => return Err(RowSkip::MissingNameOrPrice),
    };

    let name = element_text(&name_tag);
    if name.is_empty() {
        return Err(RowSkip::EmptyName);
    }
    let url = name_tag
        .value()
        .attr("href")
        .ok_or(RowSkip::MissingHref)?
        .to_string();

    let price_text = price_wrap
        .select(&PRICE_TEXT_SEL)
        .next()
        .map(|el| element_text(&el))
        .ok_or_else(|| RowSkip::MissingPriceText { name: name.clone() })?;

    let price = match normalize_price(&price_text) {
        PriceParse::Price(p) => p,
        PriceParse::Malformed(text) => return Err(RowSkip::MalformedPrice { name, text }),
    };

    let external_id = external_id_from_url(&url)
        .ok_or_else(|| RowSkip::MissingExternalId { url: url.clone() })?;

    Ok(TrackedListing {
        external_id,
        name,
        url,
        price,
        search_term: search_term.to_string(),
    })
}

/// The value of the last `key=value` segment of the url's query string.
///
/// Stored ids were produced by exactly this split, so it must not be
/// replaced with a real query parser.
pub fn external_id_from_url(url: &str) -> Option<String> {
    let query = url.rsplit('?').next().unwrap_or_default();
    let id = query.rsplit('=').next().unwrap_or_default().trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn element_text(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn card(ad: bool, name: &str, href: &str, price: Option<&str>) -> String {
        let ad_tag = if ad {
            r#"<span class="rt-product-card-ad-tag"> AD </span>"#
        } else {
            ""
        };
        let price = price
            .map(|p| format!(r#"<div class="rt-product-card-price-wrap"><strong class="rt-text-price text-price-dollar">{}</strong></div>"#, p))
            .unwrap_or_default();
        format!(
            r#"<div class="product-item">{}<a class="rt-product-card-name-wrap" href="{}"> {} </a>{}</div>"#,
            ad_tag, href, name, price
        )
    }

    fn page(cards: &[String]) -> String {
        format!("<html><body><div class=\"search-result\">{}</div></body></html>", cards.concat())
    }

    #[test]
    fn search_page_fixture() {
        let out = extract_listings(&fixture("search_page"), "BPRO-JP041");
        let ids: Vec<&str> = out.listings.iter().map(|l| l.external_id.as_str()).collect();
        assert_eq!(ids, vec!["21906123456789", "21906555000111", "21906777000222"]);
        assert_eq!(out.ads, 1);
        assert_eq!(out.skipped.len(), 2);

        let first = &out.listings[0];
        assert_eq!(first.name, "BPRO-JP041 金亮 卡片");
        assert_eq!(first.url, "https://www.ruten.com.tw/item/show?21906123456789");
        assert_eq!(first.price, 1234.0);
        assert_eq!(first.search_term, "BPRO-JP041");
        assert_eq!(out.listings[1].price, 999.0);
        assert_eq!(out.listings[2].price, 0.0);
    }

    #[test]
    fn ad_never_produces_listing() {
        let html = page(&[card(true, "Sponsored card", "https://x/item/show?111", Some("$500"))]);
        let out = extract_listings(&html, "X");
        assert!(out.listings.is_empty());
        assert_eq!(out.ads, 1);
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn ad_tag_with_other_text_is_not_an_ad() {
        let html = page(&[card(false, "Card", "https://x/item/show?222", Some("$5"))])
            .replace(r#"<a class"#, r#"<span class="rt-product-card-ad-tag">NEW</span><a class"#);
        let out = extract_listings(&html, "X");
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.ads, 0);
    }

    #[test]
    fn missing_price_container_skips_row() {
        let html = page(&[
            card(false, "No price", "https://x/item/show?1", None),
            card(false, "Priced", "https://x/item/show?2", Some("$10")),
        ]);
        let out = extract_listings(&html, "X");
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].external_id, "2");
        assert_eq!(out.skipped, vec![RowSkip::MissingNameOrPrice]);
    }

    #[test]
    fn unparseable_price_is_kept_as_zero() {
        let html = page(&[card(false, "Ask me", "https://x/item/show?9", Some("abc"))]);
        let out = extract_listings(&html, "X");
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].price, 0.0);
    }

    #[test]
    fn malformed_range_is_skipped() {
        let html = page(&[card(false, "Odd", "https://x/item/show?9", Some("call~100"))]);
        let out = extract_listings(&html, "X");
        assert!(out.listings.is_empty());
        assert!(matches!(out.skipped[0], RowSkip::MalformedPrice { .. }));
    }

    #[test]
    fn empty_name_is_skipped() {
        let html = page(&[card(false, "  ", "https://x/item/show?9", Some("$1"))]);
        let out = extract_listings(&html, "X");
        assert_eq!(out.skipped, vec![RowSkip::EmptyName]);
    }

    #[test]
    fn extraction_is_deterministic() {
        let html = fixture("search_page");
        let a = extract_listings(&html, "t");
        let b = extract_listings(&html, "t");
        assert_eq!(a.listings, b.listings);
        assert_eq!(a.skipped, b.skipped);
    }

    #[test]
    fn external_id_takes_last_query_value() {
        assert_eq!(
            external_id_from_url("https://www.ruten.com.tw/item/show?21906123456789").as_deref(),
            Some("21906123456789")
        );
        assert_eq!(
            external_id_from_url("https://goods.ruten.com.tw/item/show?a=1&id=42").as_deref(),
            Some("42")
        );
        // No query: the whole url is the id.
        assert_eq!(
            external_id_from_url("https://x/item/abc").as_deref(),
            Some("https://x/item/abc")
        );
        assert_eq!(external_id_from_url("https://x/item/show?id="), None);
    }

    #[test]
    fn container_marker() {
        assert!(has_listing_container(&fixture("search_page")));
        assert!(!has_listing_container(&fixture("empty_page")));
    }
}
