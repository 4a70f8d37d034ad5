//! SQLite persistence layer.
//!
//! Every durable store in the core is a small SQLite database in WAL mode.
//! The adapter exposes the two shapes the engine needs: ordered maps with
//! integer keys and blob values (one SQL table per map), and raw access for
//! the stores that want their own schema. Batches run inside a single
//! transaction and either commit completely or leave no trace.

mod meta;
mod nodes;
mod tables;
mod trlog;

pub use meta::{MetaInfo, STORAGE_VERSION};
pub use nodes::NodeStore;
pub use tables::{RowOp, Tablespace};
pub use trlog::{LogEntry, TrLog};

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::{Error, Result};

/// Handle to one SQLite database.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at the given path, creating parent
    /// directories as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    /// Run read-only work against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(Error::from)
    }

    /// Run a closure inside one transaction. Commits on `Ok`, rolls back on
    /// `Err`; partial writes never become visible.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Validate a map or table name before it is spliced into SQL.
fn check_ident(name: &str) -> rusqlite::Result<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap().is_ascii_digit();
    if ok {
        Ok(())
    } else {
        Err(rusqlite::Error::InvalidParameterName(name.to_string()))
    }
}

/// Create an integer-keyed map if it does not exist yet.
pub fn ensure_map(conn: &Connection, map: &str) -> rusqlite::Result<()> {
    check_ident(map)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS map_{map} (k INTEGER PRIMARY KEY, v BLOB NOT NULL);"
    ))
}

/// Unconditional put.
pub fn map_put(conn: &Connection, map: &str, k: i64, v: &[u8]) -> rusqlite::Result<()> {
    check_ident(map)?;
    conn.execute(
        &format!("INSERT OR REPLACE INTO map_{map} (k, v) VALUES (?1, ?2)"),
        params![k, v],
    )?;
    Ok(())
}

/// Insert only if the key is absent. Returns false when the key already
/// existed (the stored value is left untouched).
pub fn map_put_unique(conn: &Connection, map: &str, k: i64, v: &[u8]) -> rusqlite::Result<bool> {
    check_ident(map)?;
    let changed = conn.execute(
        &format!("INSERT OR IGNORE INTO map_{map} (k, v) VALUES (?1, ?2)"),
        params![k, v],
    )?;
    Ok(changed > 0)
}

pub fn map_get(conn: &Connection, map: &str, k: i64) -> rusqlite::Result<Option<Vec<u8>>> {
    check_ident(map)?;
    conn.query_row(
        &format!("SELECT v FROM map_{map} WHERE k = ?1"),
        params![k],
        |row| row.get(0),
    )
    .optional()
}

/// Largest key in the map, or None when empty.
pub fn map_last_key(conn: &Connection, map: &str) -> rusqlite::Result<Option<i64>> {
    check_ident(map)?;
    conn.query_row(&format!("SELECT MAX(k) FROM map_{map}"), [], |row| row.get(0))
}

/// Up to `limit` entries with key >= `from`, in ascending key order.
pub fn map_range_from(
    conn: &Connection,
    map: &str,
    from: i64,
    limit: usize,
) -> rusqlite::Result<Vec<(i64, Vec<u8>)>> {
    check_ident(map)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT k, v FROM map_{map} WHERE k >= ?1 ORDER BY k ASC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![from, limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    rows.collect()
}

#[cfg(test)]
mod adapter_tests {
    use super::*;

    #[test]
    fn map_batch_commits_atomically() {
        let db = Db::open_memory().unwrap();
        db.with_tx(|tx| {
            ensure_map(tx, "m")?;
            map_put(tx, "m", 1, b"a")?;
            map_put(tx, "m", 2, b"b")
        })
        .unwrap();

        // A failing batch leaves no partial writes behind.
        let err: Result<()> = db.with_tx(|tx| {
            map_put(tx, "m", 3, b"c")?;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(err.is_err());

        let got = db.with_conn(|c| map_range_from(c, "m", 0, 100)).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn put_unique_ignores_duplicates() {
        let db = Db::open_memory().unwrap();
        db.with_tx(|tx| {
            ensure_map(tx, "m")?;
            assert!(map_put_unique(tx, "m", 5, b"first")?);
            assert!(!map_put_unique(tx, "m", 5, b"second")?);
            Ok(())
        })
        .unwrap();

        let v = db.with_conn(|c| map_get(c, "m", 5)).unwrap().unwrap();
        assert_eq!(v, b"first");
    }

    #[test]
    fn range_is_ordered_and_bounded() {
        let db = Db::open_memory().unwrap();
        db.with_tx(|tx| {
            ensure_map(tx, "m")?;
            for k in [9i64, 3, 7, 1, 5] {
                map_put(tx, "m", k, &k.to_le_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        let got = db.with_conn(|c| map_range_from(c, "m", 4, 2)).unwrap();
        assert_eq!(got.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![5, 7]);
        assert_eq!(db.with_conn(|c| map_last_key(c, "m")).unwrap(), Some(9));
    }

    #[test]
    fn idents_are_validated() {
        let db = Db::open_memory().unwrap();
        let res = db.with_tx(|tx| ensure_map(tx, "bad name; drop"));
        assert!(res.is_err());
    }
}
