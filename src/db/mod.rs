pub mod ledger;
pub mod reconcile;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::Serialize;
use thiserror::Error;

/// Storage handle. Built once at startup and passed by reference to the
/// pipeline and the query commands.
pub struct Store {
    conn: Connection,
    run_lock: Mutex<()>,
}

#[derive(Debug, Error)]
pub enum BeginError {
    #[error("another run is already in progress")]
    Overlapped,
    #[error("failed to open run transaction: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Store {
            conn,
            run_lock: Mutex::new(()),
        }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Drop both tables and recreate them empty.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.try_lock().ok_or(BeginError::Overlapped)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(
            "DROP TABLE IF EXISTS price_records;
             DROP TABLE IF EXISTS products;",
        )?;
        tx.execute_batch(SCHEMA)?;
        tx.commit()?;
        Ok(())
    }

    /// Open the single write transaction of a run.
    ///
    /// Fails with `Overlapped` while another `RunSession` from this handle is
    /// alive. `BEGIN IMMEDIATE` also keeps a second process from interleaving
    /// its own run on the same database file.
    pub fn begin_run(&self) -> Result<RunSession<'_>, BeginError> {
        let guard = self.try_lock().ok_or(BeginError::Overlapped)?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Ok(RunSession { tx, _guard: guard })
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.run_lock.try_lock() {
            Ok(guard) => Some(guard),
            // A panicked run already rolled back when its session dropped.
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    // ── Queries ──

    pub fn tracked_products(&self) -> Result<Vec<Product>> {
        let sql = format!(
            "SELECT {} FROM products WHERE is_tracking = 1 ORDER BY id",
            PRODUCT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn product(&self, id: i64) -> Result<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE id = ?1", PRODUCT_COLUMNS);
        let product = self
            .conn
            .query_row(&sql, [id], product_from_row)
            .optional()?;
        Ok(product)
    }

    /// Price history of one product, oldest first.
    pub fn price_history(&self, product_id: i64) -> Result<Vec<PriceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, product_id, price, crawl_timestamp
             FROM price_records
             WHERE product_id = ?1
             ORDER BY crawl_timestamp, id",
        )?;
        let rows = stmt
            .query_map([product_id], price_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Tracked products with their latest price, optionally limited to one
    /// search term.
    pub fn overview(&self, limit: usize, term: Option<&str>) -> Result<Vec<OverviewRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.name, COALESCE(p.search_term, ''),
                    (SELECT pr.price FROM price_records pr
                      WHERE pr.product_id = p.id
                      ORDER BY pr.crawl_timestamp DESC, pr.id DESC LIMIT 1),
                    (SELECT COUNT(*) FROM price_records pr WHERE pr.product_id = p.id),
                    (SELECT MAX(pr.crawl_timestamp) FROM price_records pr
                      WHERE pr.product_id = p.id)
             FROM products p
             WHERE p.is_tracking = 1
               AND (?2 IS NULL OR p.search_term = ?2)
             ORDER BY p.search_term, p.id
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, term], |row| {
                let last_seen: Option<String> = row.get(5)?;
                Ok(OverviewRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    search_term: row.get(2)?,
                    latest_price: row.get(3)?,
                    records: row.get(4)?,
                    last_seen: last_seen.map(|s| parse_ts(&s, 5)).transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Daily average price per search term, across every product that has
    /// price records. An empty `terms` slice means all terms. Days are UTC.
    pub fn keyword_trend(&self, terms: &[String]) -> Result<Vec<TrendPoint>> {
        let filter = if terms.is_empty() {
            String::new()
        } else {
            let marks = vec!["?"; terms.len()].join(", ");
            format!("WHERE p.search_term IN ({})", marks)
        };
        let sql = format!(
            "SELECT COALESCE(p.search_term, ''),
                    substr(pr.crawl_timestamp, 1, 10) AS day,
                    AVG(pr.price),
                    COUNT(*)
             FROM price_records pr
             JOIN products p ON pr.product_id = p.id
             {}
             GROUP BY p.search_term, day
             ORDER BY p.search_term, day",
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(terms.iter()), |row| {
                let day: String = row.get(1)?;
                Ok(TrendPoint {
                    search_term: row.get(0)?,
                    day: NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                    })?,
                    avg_price: row.get(2)?,
                    records: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<Stats> {
        let products: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        let tracking: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM products WHERE is_tracking = 1",
            [],
            |r| r.get(0),
        )?;
        let price_records: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM price_records", [], |r| r.get(0))?;
        let last: Option<String> = self.conn.query_row(
            "SELECT MAX(crawl_timestamp) FROM price_records",
            [],
            |r| r.get(0),
        )?;
        Ok(Stats {
            products,
            tracking,
            price_records,
            last_crawl: last.map(|s| parse_ts(&s, 0)).transpose()?,
        })
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS products (
        id          INTEGER PRIMARY KEY,
        ruten_id    TEXT UNIQUE NOT NULL,
        name        TEXT NOT NULL,
        url         TEXT NOT NULL,
        search_term TEXT,
        is_tracking INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_products_tracking ON products(is_tracking);

    CREATE TABLE IF NOT EXISTS price_records (
        id              INTEGER PRIMARY KEY,
        product_id      INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        price           REAL NOT NULL,
        crawl_timestamp TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_price_records_product
        ON price_records(product_id, crawl_timestamp);
";

/// The run's transaction plus the handle's run lock.
///
/// Dropping a session without calling `commit` rolls the whole run back.
pub struct RunSession<'a> {
    // Declared first so the transaction ends before the lock is released.
    tx: Transaction<'a>,
    _guard: MutexGuard<'a, ()>,
}

impl RunSession<'_> {
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn commit(self) -> Result<()> {
        let RunSession { tx, _guard } = self;
        tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        let RunSession { tx, _guard } = self;
        tx.rollback()?;
        Ok(())
    }
}

// ── Rows ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub ruten_id: String,
    pub name: String,
    pub url: String,
    pub search_term: Option<String>,
    pub is_tracking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRecord {
    pub id: i64,
    pub product_id: i64,
    pub price: f64,
    pub crawl_timestamp: DateTime<Utc>,
}

pub struct OverviewRow {
    pub id: i64,
    pub name: String,
    pub search_term: String,
    pub latest_price: Option<f64>,
    pub records: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub search_term: String,
    pub day: NaiveDate,
    pub avg_price: f64,
    pub records: usize,
}

pub struct Stats {
    pub products: usize,
    pub tracking: usize,
    pub price_records: usize,
    pub last_crawl: Option<DateTime<Utc>>,
}

pub(crate) const PRODUCT_COLUMNS: &str = "id, ruten_id, name, url, search_term, is_tracking";

pub(crate) fn product_from_row(row: &Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        ruten_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        search_term: row.get(4)?,
        is_tracking: row.get(5)?,
    })
}

fn price_record_from_row(row: &Row) -> rusqlite::Result<PriceRecord> {
    let ts: String = row.get(3)?;
    Ok(PriceRecord {
        id: row.get(0)?,
        product_id: row.get(1)?,
        price: row.get(2)?,
        crawl_timestamp: parse_ts(&ts, 3)?,
    })
}

/// Fixed-width RFC 3339 so text order matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

// ── Tests ──
