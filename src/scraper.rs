use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::parser;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            // Spider only hands back the message text.
            FetchError::Request(e) => {
                e.contains("429") || e.contains("502") || e.contains("503") || e.contains("rate")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("bad search url: {0}")]
    Url(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("listing container did not appear within {0:?}")]
    Timeout(Duration),
}

/// Something that can turn a URL into page markup.
pub trait PageSource {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>>;
}

/// Plain HTTP fetch with a desktop browser User-Agent.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpSource { client })
    }
}

impl PageSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        resp.text()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))
    }
}

/// Rendered fetch through spider.cloud, for pages that only fill in with JS.
pub struct SpiderSource {
    spider: Spider,
}

impl SpiderSource {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| anyhow::anyhow!("SPIDER_API_KEY environment variable must be set"))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
        Ok(SpiderSource { spider })
    }
}

impl PageSource for SpiderSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        if let Some(status) = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .filter(|s| *s >= 400)
        {
            return Err(FetchError::Status {
                status: status as u16,
                url: url.to_string(),
            });
        }

        first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Request("no content in spider response".into()))
    }
}

async fn fetch_with_retry<S: PageSource>(source: &S, url: &str) -> Result<String, FetchError> {
    let mut attempt = 0;
    loop {
        match source.fetch(url).await {
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "{} (attempt {}/{}), backing off {:.1}s",
                    e,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64()
                );
                sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ── Search pages ──

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub search_url: String,
    pub settle: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

/// `{base}?q={term}&p={page}`, form-encoded.
pub fn search_url(base: &str, term: &str, page: u32) -> Result<String, PageError> {
    let mut url = reqwest::Url::parse(base).map_err(|e| PageError::Url(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("q", term)
        .append_pair("p", &page.to_string());
    Ok(url.into())
}

/// Fetch one search-results page and wait, bounded by `wait_timeout`, until it
/// shows at least one listing container.
pub async fn load_search_page<S: PageSource>(
    source: &S,
    term: &str,
    page: u32,
    opts: &PageOptions,
) -> Result<String, PageError> {
    let url = search_url(&opts.search_url, term, page)?;
    let deadline = Instant::now() + opts.wait_timeout;

    loop {
        let html = fetch_with_retry(source, &url).await?;
        if !opts.settle.is_zero() {
            sleep(opts.settle).await;
        }
        if parser::has_listing_container(&html) {
            return Ok(html);
        }
        if Instant::now() >= deadline {
            return Err(PageError::Timeout(opts.wait_timeout));
        }
        debug!(url = %url, "Listings not rendered yet, polling again");
        sleep(opts.poll_interval).await;
    }
}

// ── Tests ──
