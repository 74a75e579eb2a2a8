mod db;
mod parser;
mod pipeline;
mod schedule;
mod scraper;
mod settings;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use db::Store;
use pipeline::{Pipeline, RunStatus};
use scraper::{HttpSource, PageSource, SpiderSource};
use settings::{Backend, Settings};

#[derive(Parser)]
#[command(name = "ruten_scraper", about = "Ruten price tracker: scrape search results into a price history")]
struct Cli {
    /// Config file (default: ./ruten_scraper.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Scrape every tracked term once and commit the prices as one run
    Run {
        /// Search term (repeatable; default: configured terms)
        #[arg(short, long = "term")]
        terms: Vec<String>,
        /// Max result pages per term
        #[arg(short, long)]
        pages: Option<u32>,
    },
    /// Run on a fixed interval until Ctrl-C
    Watch {
        /// Hours between runs
        #[arg(long)]
        interval_hours: Option<u64>,
        /// Wait one interval before the first run
        #[arg(long)]
        no_immediate: bool,
    },
    /// Tracked products with their latest price
    Products {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        /// Only products first found under this search term
        #[arg(short, long)]
        term: Option<String>,
        /// Print every tracked product as JSON
        #[arg(long)]
        json: bool,
    },
    /// Price history of one product, oldest first
    History {
        product_id: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Daily average price per search term
    Trend {
        /// Search term (repeatable; default: every term with records)
        #[arg(short, long = "term")]
        terms: Vec<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show database statistics
    Stats,
    /// Drop and recreate all tables
    Reset {
        /// Confirm deleting every product and price record
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = settings::load(cli.config.as_deref())?;

    let store = Store::open(&settings.db_path)?;
    store.init_schema()?;

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready at {:?}", settings.db_path);
            Ok(())
        }
        Commands::Run { terms, pages } => {
            let terms = if terms.is_empty() {
                settings.tracked_terms()
            } else {
                let terms = settings::normalize_terms(&terms);
                if terms.is_empty() {
                    bail!("--term values are all blank");
                }
                terms
            };
            let pages = pages.unwrap_or(settings.max_pages);
            if pages < 1 {
                bail!("--pages must be at least 1");
            }
            scrape(&store, &settings, ScrapeMode::Once { terms, pages }).await
        }
        Commands::Watch {
            interval_hours,
            no_immediate,
        } => {
            let every = match interval_hours {
                Some(h) => settings::interval_from_hours(h)?,
                None => settings.interval(),
            };
            let mode = ScrapeMode::Watch {
                every,
                immediate: !no_immediate,
            };
            scrape(&store, &settings, mode).await
        }
        Commands::Products { limit, term, json } => {
            let term = term.as_deref().map(str::trim).filter(|t| !t.is_empty());
            if json {
                let mut products = store.tracked_products()?;
                if let Some(t) = term {
                    products.retain(|p| p.search_term.as_deref() == Some(t));
                }
                println!("{}", serde_json::to_string_pretty(&products)?);
                return Ok(());
            }
            let rows = store.overview(limit, term)?;
            if rows.is_empty() {
                println!("No tracked products. Run 'run' first.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<36} | {:<16} | {:>10} | {:>5} | {:<16}",
                "ID", "Product", "Term", "Price", "Recs", "Last update"
            );
            println!("{}", "-".repeat(102));
            for r in &rows {
                let price = r
                    .latest_price
                    .map(|p| format!("{:.0}", p))
                    .unwrap_or_else(|| "N/A".into());
                let last = r
                    .last_seen
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "N/A".into());
                println!(
                    "{:>5} | {:<36} | {:<16} | {:>10} | {:>5} | {:<16}",
                    r.id,
                    truncate(&r.name, 36),
                    truncate(&r.search_term, 16),
                    price,
                    r.records,
                    last
                );
            }
            println!("\n{} products", rows.len());
            Ok(())
        }
        Commands::History { product_id, json } => {
            let Some(product) = store.product(product_id)? else {
                bail!("No product with id {}", product_id);
            };
            let history = store.price_history(product_id)?;
            if json {
                let out = serde_json::json!({ "product": product, "history": history });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }

            println!("{} ({})\n{}\n", product.name, product.ruten_id, product.url);
            if history.is_empty() {
                println!("No price records yet.");
            }
            for r in &history {
                println!(
                    "{}  NT${:>10.0}",
                    r.crawl_timestamp.format("%Y-%m-%d %H:%M:%S"),
                    r.price
                );
            }
            Ok(())
        }
        Commands::Trend { terms, json } => {
            let points = store.keyword_trend(&settings::normalize_terms(&terms))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&points)?);
                return Ok(());
            }
            if points.is_empty() {
                println!("Not enough price history to compute a trend.");
                return Ok(());
            }

            println!("{:<24} | {:<10} | {:>10} | {:>5}", "Term", "Day", "Avg price", "Recs");
            println!("{}", "-".repeat(58));
            for p in &points {
                println!(
                    "{:<24} | {:<10} | {:>10.1} | {:>5}",
                    truncate(&p.search_term, 24),
                    p.day,
                    p.avg_price,
                    p.records
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let s = store.stats()?;
            println!("Products:      {}", s.products);
            println!("Tracking:      {}", s.tracking);
            println!("Price records: {}", s.price_records);
            println!(
                "Last crawl:    {}",
                s.last_crawl
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            );
            Ok(())
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("Refusing to reset without --yes");
            }
            store.reset()?;
            println!("Dropped and recreated products and price_records.");
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

enum ScrapeMode {
    Once { terms: Vec<String>, pages: u32 },
    Watch { every: Duration, immediate: bool },
}

async fn scrape(store: &Store, settings: &Settings, mode: ScrapeMode) -> Result<()> {
    match settings.backend {
        Backend::Http => {
            let source = HttpSource::new(&settings.user_agent)?;
            scrape_with(store, &source, settings, mode).await
        }
        Backend::Spider => {
            let source = SpiderSource::from_env()?;
            scrape_with(store, &source, settings, mode).await
        }
    }
}

async fn scrape_with<S: PageSource>(
    store: &Store,
    source: &S,
    settings: &Settings,
    mode: ScrapeMode,
) -> Result<()> {
    let pipeline = Pipeline::new(store, source, settings.page_options());

    match mode {
        ScrapeMode::Once { terms, pages } => {
            println!("Scraping {} terms x {} pages...", terms.len(), pages);
            let summary = pipeline.run_once(&terms, pages).await;
            println!("{}", summary);
            if let RunStatus::RolledBack { reason } = summary.status {
                bail!("Run rolled back: {}", reason);
            }
            Ok(())
        }
        ScrapeMode::Watch { every, immediate } => {
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            schedule::watch(
                &pipeline,
                &settings.tracked_terms(),
                settings.max_pages,
                every,
                immediate,
                shutdown,
            )
            .await;
            Ok(())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
