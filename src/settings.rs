use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::scraper::PageOptions;

const DEFAULT_FILE: &str = "ruten_scraper";
const ENV_PREFIX: &str = "RUTEN";
pub const MAX_INTERVAL_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Http,
    Spider,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub search_url: String,
    pub terms: Vec<String>,
    pub max_pages: u32,
    pub settle_delay_secs: u64,
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub interval_hours: u64,
    pub user_agent: String,
    pub backend: Backend,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/ruten_price.sqlite"),
            search_url: "https://www.ruten.com.tw/find/".to_string(),
            terms: vec!["BPRO-JP024 金亮".to_string(), "BPRO-JP041".to_string()],
            max_pages: 1,
            settle_delay_secs: 5,
            wait_timeout_secs: 10,
            poll_interval_ms: 1000,
            interval_hours: 6,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            backend: Backend::Http,
        }
    }
}

/// Defaults, then `ruten_scraper.toml` (or `path`), then `RUTEN_*` env vars.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = match path {
        Some(p) => File::from(p).required(true),
        None => File::with_name(DEFAULT_FILE).required(false),
    };
    let settings: Settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("terms"),
        )
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.max_pages < 1 {
            bail!("max_pages must be at least 1");
        }
        if self.terms.iter().all(|t| t.trim().is_empty()) {
            bail!("no search terms configured");
        }
        interval_from_hours(self.interval_hours)?;
        reqwest::Url::parse(&self.search_url)
            .with_context(|| format!("search_url {:?} is not a valid URL", self.search_url))?;
        Ok(())
    }

    /// Configured terms, trimmed, blanks dropped, order kept.
    pub fn tracked_terms(&self) -> Vec<String> {
        normalize_terms(&self.terms)
    }

    pub fn page_options(&self) -> PageOptions {
        PageOptions {
            search_url: self.search_url.clone(),
            settle: Duration::from_secs(self.settle_delay_secs),
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }
}

/// Trim every term and drop the blank ones, keeping order.
pub fn normalize_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn interval_from_hours(hours: u64) -> Result<Duration> {
    if !(1..=MAX_INTERVAL_HOURS).contains(&hours) {
        bail!(
            "interval_hours must be between 1 and {}, got {}",
            MAX_INTERVAL_HOURS,
            hours
        );
    }
    Ok(Duration::from_secs(hours * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(s: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(s, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.tracked_terms(), vec!["BPRO-JP024 金亮", "BPRO-JP041"]);
        assert_eq!(s.page_options().wait_timeout, Duration::from_secs(10));
    }

    #[test]
    fn file_overrides_defaults() {
        let s = from_toml(
            r#"
            terms = ["  卡片 ", "", "BPRO"]
            max_pages = 3
            backend = "spider"
            "#,
        );
        assert_eq!(s.max_pages, 3);
        assert_eq!(s.backend, Backend::Spider);
        assert_eq!(s.tracked_terms(), vec!["卡片", "BPRO"]);
        // untouched keys keep their defaults
        assert_eq!(s.interval_hours, 6);
    }

    #[test]
    fn zero_pages_rejected() {
        let s = from_toml("max_pages = 0");
        assert!(s.validate().is_err());
    }

    #[test]
    fn interval_is_bounded() {
        assert_eq!(interval_from_hours(6).unwrap(), Duration::from_secs(6 * 3600));
        assert!(interval_from_hours(0).is_err());
        assert!(interval_from_hours(MAX_INTERVAL_HOURS + 1).is_err());
        assert!(interval_from_hours(u64::MAX).is_err());

        let s = from_toml(&format!("interval_hours = {}", u64::MAX / 2));
        assert!(s.validate().is_err());
    }

    #[test]
    fn normalize_terms_drops_blanks() {
        let raw = vec![" ".to_string(), "  BPRO ".to_string(), "".to_string(), "卡".to_string()];
        assert_eq!(normalize_terms(&raw), vec!["BPRO", "卡"]);
        assert!(normalize_terms(&[" ".to_string()]).is_empty());
    }

    #[test]
    fn blank_terms_rejected() {
        let s = from_toml(r#"terms = [" "]"#);
        assert!(s.validate().is_err());
    }
}
