use std::fmt;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::ledger::Ledger;
use crate::db::{reconcile, BeginError, RunSession, Store};
use crate::parser;
use crate::scraper::{load_search_page, PageOptions, PageSource};

/// Failures that abort a run and roll back everything it wrote.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("reconciling {ruten_id} failed: {cause:#}")]
    Reconcile { ruten_id: String, cause: anyhow::Error },
    #[error("appending price for product {product_id} failed: {cause:#}")]
    Ledger { product_id: i64, cause: anyhow::Error },
    #[error("commit failed: {0:#}")]
    Commit(anyhow::Error),
    #[error(transparent)]
    Begin(BeginError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    RolledBack { reason: String },
    /// Another run held the store; nothing was fetched or written.
    Overlapped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub items_written: usize,
    pub products_created: usize,
    pub rows_skipped: usize,
    pub ads_skipped: usize,
    pub pages_fetched: usize,
    pub page_errors: usize,
    pub status: RunStatus,
}

impl RunSummary {
    fn new() -> Self {
        RunSummary {
            items_written: 0,
            products_created: 0,
            rows_skipped: 0,
            ads_skipped: 0,
            pages_fetched: 0,
            page_errors: 0,
            status: RunStatus::Committed,
        }
    }

    fn rolled_back(mut self, err: &RunError) -> Self {
        self.items_written = 0;
        self.products_created = 0;
        self.status = RunStatus::RolledBack {
            reason: err.to_string(),
        };
        self
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            RunStatus::Committed => "committed".to_string(),
            RunStatus::RolledBack { reason } => format!("rolled back ({})", reason),
            RunStatus::Overlapped => "skipped (another run in progress)".to_string(),
        };
        write!(
            f,
            "{}: {} prices written, {} new products, {} rows skipped, {} ads, {} pages ({} failed)",
            status,
            self.items_written,
            self.products_created,
            self.rows_skipped,
            self.ads_skipped,
            self.pages_fetched,
            self.page_errors,
        )
    }
}

/// Drives one scrape-to-storage run over all tracked terms.
pub struct Pipeline<'a, S> {
    store: &'a Store,
    source: &'a S,
    opts: PageOptions,
}

impl<'a, S: PageSource> Pipeline<'a, S> {
    pub fn new(store: &'a Store, source: &'a S, opts: PageOptions) -> Self {
        Pipeline {
            store,
            source,
            opts,
        }
    }

    /// Run every term over pages `1..=max_pages` inside one transaction.
    ///
    /// Page failures only shrink the result. Storage failures roll the whole
    /// run back. Never returns an error; the outcome is in `status`.
    pub async fn run_once(&self, terms: &[String], max_pages: u32) -> RunSummary {
        let t0 = Instant::now();
        info!(terms = terms.len(), max_pages, "Run started");

        let session = match self.store.begin_run() {
            Ok(s) => s,
            Err(BeginError::Overlapped) => {
                warn!("Run skipped: another run is in progress");
                let mut summary = RunSummary::new();
                summary.status = RunStatus::Overlapped;
                return summary;
            }
            Err(e) => {
                let err = RunError::Begin(e);
                error!(critical = true, "Run aborted: {}", err);
                return RunSummary::new().rolled_back(&err);
            }
        };

        let mut summary = RunSummary::new();
        let outcome = match self.execute(&session, terms, max_pages, &mut summary).await {
            Ok(()) => session.commit().map_err(RunError::Commit),
            Err(e) => {
                if let Err(rb) = session.rollback() {
                    error!(critical = true, "Rollback failed: {:#}", rb);
                }
                Err(e)
            }
        };

        let summary = match outcome {
            Ok(()) => summary,
            Err(e) => {
                error!(critical = true, "Run rolled back: {}", e);
                summary.rolled_back(&e)
            }
        };
        info!(elapsed_s = t0.elapsed().as_secs_f64(), "{}", summary);
        summary
    }

    async fn execute(
        &self,
        session: &RunSession<'_>,
        terms: &[String],
        max_pages: u32,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        let conn = session.conn();
        let mut ledger = Ledger::new();

        let pb = ProgressBar::new(terms.len() as u64 * max_pages as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );

        for term in terms {
            for page in 1..=max_pages {
                pb.set_message(format!("{} p{}", term, page));
                let listings = match load_search_page(self.source, term, page, &self.opts).await {
                    Ok(html) => {
                        summary.pages_fetched += 1;
                        let extract = parser::extract_listings(&html, term);
                        summary.ads_skipped += extract.ads;
                        summary.rows_skipped += extract.skipped.len();
                        extract.listings
                    }
                    Err(e) => {
                        summary.page_errors += 1;
                        error!(term = %term, page, "Page failed: {}", e);
                        Vec::new()
                    }
                };
                pb.inc(1);

                if listings.is_empty() && page > 1 {
                    debug!(term = %term, page, "No more results");
                    pb.inc((max_pages - page) as u64);
                    break;
                }

                for listing in &listings {
                    let resolved =
                        reconcile::resolve(conn, listing).map_err(|cause| RunError::Reconcile {
                            ruten_id: listing.external_id.clone(),
                            cause,
                        })?;
                    let product_id = resolved.product.id;
                    ledger
                        .append(conn, product_id, listing.price)
                        .map_err(|cause| RunError::Ledger { product_id, cause })?;
                    if resolved.created {
                        summary.products_created += 1;
                    }
                    summary.items_written += 1;
                }
                info!(term = %term, page, items = listings.len(), "Page stored");
            }
        }

        pb.finish_and_clear();
        Ok(())
    }
}

// ── Tests ──
