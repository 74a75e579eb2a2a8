use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{product_from_row, Product, PRODUCT_COLUMNS};
use crate::parser::TrackedListing;

pub struct Resolved {
    pub product: Product,
    pub created: bool,
}

/// Resolve a listing to its product row, inserting it on first sight.
///
/// An existing row is returned as stored: name, url and search term keep the
/// values from the first sighting. A new row's id is usable immediately
/// inside the caller's open transaction.
pub fn resolve(conn: &Connection, listing: &TrackedListing) -> Result<Resolved> {
    if let Some(product) = find_by_external_id(conn, &listing.external_id)? {
        return Ok(Resolved {
            product,
            created: false,
        });
    }

    conn.prepare_cached(
        "INSERT INTO products (ruten_id, name, url, search_term, is_tracking)
         VALUES (?1, ?2, ?3, ?4, 1)",
    )?
    .execute(params![
        listing.external_id,
        listing.name,
        listing.url,
        listing.search_term,
    ])?;
    let id = conn.last_insert_rowid();
    debug!(id, ruten_id = %listing.external_id, "New product");

    Ok(Resolved {
        product: Product {
            id,
            ruten_id: listing.external_id.clone(),
            name: listing.name.clone(),
            url: listing.url.clone(),
            search_term: Some(listing.search_term.clone()),
            is_tracking: true,
        },
        created: true,
    })
}

pub fn find_by_external_id(conn: &Connection, ruten_id: &str) -> Result<Option<Product>> {
    let sql = format!("SELECT {} FROM products WHERE ruten_id = ?1", PRODUCT_COLUMNS);
    let product = conn
        .prepare_cached(&sql)?
        .query_row([ruten_id], product_from_row)
        .optional()?;
    Ok(product)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{count, listing, store};

    #[test]
    fn resolve_is_idempotent_within_a_run() {
        let store = store();
        let session = store.begin_run().unwrap();
        let a = resolve(session.conn(), &listing("42", "card", 10.0)).unwrap();
        let b = resolve(session.conn(), &listing("42", "card", 11.0)).unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.product.id, b.product.id);
        session.commit().unwrap();
        assert_eq!(count(&store, "products"), 1);
    }

    #[test]
    fn resolve_is_idempotent_across_runs() {
        let store = store();
        let session = store.begin_run().unwrap();
        let first = resolve(session.conn(), &listing("42", "card", 10.0)).unwrap();
        session.commit().unwrap();

        let session = store.begin_run().unwrap();
        let again = resolve(session.conn(), &listing("42", "card", 10.0)).unwrap();
        session.commit().unwrap();

        assert_eq!(first.product.id, again.product.id);
        assert!(!again.created);
        assert_eq!(count(&store, "products"), 1);
    }

    #[test]
    fn resight_keeps_first_name_and_url() {
        let store = store();
        let session = store.begin_run().unwrap();
        resolve(session.conn(), &listing("42", "old name", 10.0)).unwrap();
        let mut renamed = listing("42", "new name", 10.0);
        renamed.url = "https://www.ruten.com.tw/item/show?moved=42".to_string();
        let again = resolve(session.conn(), &renamed).unwrap();
        session.commit().unwrap();

        assert_eq!(again.product.name, "old name");
        assert_eq!(again.product.url, "https://www.ruten.com.tw/item/show?42");
        let stored = store.product(again.product.id).unwrap().unwrap();
        assert_eq!(stored.name, "old name");
    }

    #[test]
    fn new_product_is_tracking() {
        let store = store();
        let session = store.begin_run().unwrap();
        let r = resolve(session.conn(), &listing("7", "x", 1.0)).unwrap();
        assert!(r.product.is_tracking);
        assert!(r.product.id > 0);
        let found = find_by_external_id(session.conn(), "7").unwrap().unwrap();
        assert_eq!(found, r.product);
    }
}
