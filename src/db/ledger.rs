use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection};

use super::{format_ts, PriceRecord};

/// Append-only writer for `price_records`.
///
/// One ledger per run: timestamps it hands out never go backwards, even if the
/// wall clock does.
#[derive(Default)]
pub struct Ledger {
    last: Option<DateTime<Utc>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, conn: &Connection, product_id: i64, price: f64) -> Result<PriceRecord> {
        self.append_at(conn, product_id, price, Utc::now())
    }

    pub fn append_at(
        &mut self,
        conn: &Connection,
        product_id: i64,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<PriceRecord> {
        let mut at = at.trunc_subsecs(6);
        if let Some(last) = self.last {
            at = at.max(last);
        }

        conn.prepare_cached(
            "INSERT INTO price_records (product_id, price, crawl_timestamp)
             VALUES (?1, ?2, ?3)",
        )?
        .execute(params![product_id, price, format_ts(&at)])?;
        self.last = Some(at);

        Ok(PriceRecord {
            id: conn.last_insert_rowid(),
            product_id,
            price,
            crawl_timestamp: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::reconcile::resolve;
    use crate::db::tests::{count, listing, store};
    use chrono::Duration;

    #[test]
    fn history_is_ascending_and_grows() {
        let store = store();
        let session = store.begin_run().unwrap();
        let mut ledger = Ledger::new();
        let p = resolve(session.conn(), &listing("1", "a", 1.0)).unwrap().product;
        ledger.append(session.conn(), p.id, 300.0).unwrap();
        ledger.append(session.conn(), p.id, 250.0).unwrap();
        session.commit().unwrap();
        let before = store.price_history(p.id).unwrap();

        let session = store.begin_run().unwrap();
        let mut ledger = Ledger::new();
        ledger.append(session.conn(), p.id, 240.0).unwrap();
        session.commit().unwrap();
        let after = store.price_history(p.id).unwrap();

        assert_eq!(before.len(), 2);
        assert_eq!(after.len(), 3);
        // Earlier rows are untouched.
        assert_eq!(&after[..2], &before[..]);
        let prices: Vec<f64> = after.iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![300.0, 250.0, 240.0]);
        assert!(after.windows(2).all(|w| w[0].crawl_timestamp <= w[1].crawl_timestamp));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let store = store();
        let session = store.begin_run().unwrap();
        let mut ledger = Ledger::new();
        let p = resolve(session.conn(), &listing("1", "a", 1.0)).unwrap().product;
        let now = Utc::now();
        let first = ledger.append_at(session.conn(), p.id, 1.0, now).unwrap();
        let second = ledger
            .append_at(session.conn(), p.id, 2.0, now - Duration::minutes(5))
            .unwrap();
        assert_eq!(second.crawl_timestamp, first.crawl_timestamp);
        session.commit().unwrap();

        let history = store.price_history(p.id).unwrap();
        assert_eq!(history[0].crawl_timestamp, first.crawl_timestamp);
        assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    }

    #[test]
    fn unknown_product_is_a_storage_error() {
        let store = store();
        let session = store.begin_run().unwrap();
        let mut ledger = Ledger::new();
        assert!(ledger.append(session.conn(), 999, 1.0).is_err());
        drop(session);
        assert_eq!(count(&store, "price_records"), 0);
    }
}
