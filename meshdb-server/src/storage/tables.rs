//! Tablespace: local table state plus the per-origin log registry.
//!
//! Row-level mutations never touch table state directly. A local
//! `create_table` or `insert_row` appends an operation to this node's own
//! TR-log; the committer later decodes and executes it through
//! [`Tablespace::apply_op`], the same path replicated operations take. That
//! keeps local and remote mutations convergent: everything is an ordered
//! replay of per-origin logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Db, TrLog, check_ident};
use crate::error::{Error, Result};

/// A row-level operation carried as a TR-log payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op")]
pub enum RowOp {
    #[serde(rename = "create_table")]
    CreateTable { name: String, columns: Vec<String> },
    #[serde(rename = "insert_row")]
    InsertRow { table: String, values: Vec<String> },
}

impl RowOp {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("row op serialization")
    }

    pub fn decode(payload: &[u8]) -> Result<RowOp> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::invalid_message(format!("row op payload: {e}")))
    }
}

pub struct Tablespace {
    root: PathBuf,
    local_origin: Uuid,
    db: Db,
    logs: RwLock<HashMap<Uuid, Arc<TrLog>>>,
}

impl Tablespace {
    /// Open the tablespace under `root`. `local_origin` is this node's
    /// UUID; its log is the one local mutations append to.
    pub fn open(root: &Path, local_origin: Uuid) -> Result<Tablespace> {
        let db = Db::open(root.join("tables").join("tables.db"))?;
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS table_defs (
                    name    TEXT PRIMARY KEY,
                    columns TEXT NOT NULL
                );",
            )
        })?;

        let space = Tablespace {
            root: root.to_path_buf(),
            local_origin,
            db,
            logs: RwLock::new(HashMap::new()),
        };
        // Make sure our own log exists even before the first write.
        space.trlog(local_origin)?;
        Ok(space)
    }

    pub fn local_origin(&self) -> Uuid {
        self.local_origin
    }

    /// The TR-log for `origin`, opened on first use.
    pub fn trlog(&self, origin: Uuid) -> Result<Arc<TrLog>> {
        if let Some(log) = self.logs.read().get(&origin) {
            return Ok(log.clone());
        }

        let mut logs = self.logs.write();
        if let Some(log) = logs.get(&origin) {
            return Ok(log.clone());
        }
        let log = Arc::new(TrLog::open(origin, &self.root)?);
        logs.insert(origin, log.clone());
        Ok(log.clone())
    }

    /// Every origin with a log on disk, whether or not it is open yet.
    pub fn origins(&self) -> Result<Vec<Uuid>> {
        let mut origins: Vec<Uuid> =
            self.logs.read().keys().copied().collect();

        let dir = self.root.join("trlog");
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if let Ok(uuid) = entry.file_name().to_string_lossy().parse::<Uuid>() {
                    if !origins.contains(&uuid) {
                        origins.push(uuid);
                    }
                }
            }
        }
        origins.sort();
        Ok(origins)
    }

    /// All logs with unapplied entries, opening on-disk logs as needed.
    pub fn changed_logs(&self) -> Result<Vec<Arc<TrLog>>> {
        let mut out = Vec::new();
        for origin in self.origins()? {
            let log = self.trlog(origin)?;
            if log.changed() {
                out.push(log);
            }
        }
        Ok(out)
    }

    // ── Local mutations ─────────────────────────────────────────

    /// Record a create-table operation in the local log. Returns its id.
    pub fn create_table(&self, name: &str, columns: &[String]) -> Result<u64> {
        check_ident(name)?;
        let op = RowOp::CreateTable { name: name.to_string(), columns: columns.to_vec() };
        self.trlog(self.local_origin)?.append_local(op.encode())
    }

    /// Record an insert-row operation in the local log. Returns its id.
    pub fn insert_row(&self, table: &str, values: &[String]) -> Result<u64> {
        let op = RowOp::InsertRow { table: table.to_string(), values: values.to_vec() };
        self.trlog(self.local_origin)?.append_local(op.encode())
    }

    // ── Replay ──────────────────────────────────────────────────

    /// Execute one decoded TR-log payload against table state. This is the
    /// committer's apply function: true advances the applied cursor, false
    /// halts the log until the next wake.
    pub fn apply_op(&self, payload: &[u8]) -> bool {
        let op = match RowOp::decode(payload) {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!("undecodable row operation: {e}");
                return false;
            }
        };

        match self.exec_op(&op) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(?op, "row operation failed: {e}");
                false
            }
        }
    }

    fn exec_op(&self, op: &RowOp) -> Result<()> {
        match op {
            RowOp::CreateTable { name, columns } => {
                self.db.with_tx(|tx| {
                    check_ident(name)?;
                    // Re-creating an existing table is a no-op so replays
                    // and concurrent creators converge.
                    tx.execute(
                        "INSERT OR IGNORE INTO table_defs (name, columns) VALUES (?1, ?2)",
                        params![name, serde_json::to_string(columns).unwrap_or_default()],
                    )?;
                    tx.execute_batch(&format!(
                        "CREATE TABLE IF NOT EXISTS tbl_{name} (
                            k INTEGER PRIMARY KEY AUTOINCREMENT,
                            v TEXT NOT NULL
                        );"
                    ))
                })
            }
            RowOp::InsertRow { table, values } => {
                let exists = self.db.with_conn(|conn| {
                    check_ident(table)?;
                    conn.query_row(
                        "SELECT COUNT(*) FROM table_defs WHERE name = ?1",
                        params![table],
                        |row| row.get::<_, i64>(0),
                    )
                })?;
                if exists == 0 {
                    // The create may still be in flight in another origin's
                    // log; fail so this log halts and retries next wake.
                    return Err(Error::failed(format!("table '{table}' does not exist")));
                }
                self.db.with_conn(|conn| {
                    conn.execute(
                        &format!("INSERT INTO tbl_{table} (v) VALUES (?1)"),
                        params![serde_json::to_string(values).unwrap_or_default()],
                    )?;
                    Ok(())
                })
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let count = self.db.with_conn(|conn| {
            check_ident(name)?;
            conn.query_row(
                "SELECT COUNT(*) FROM table_defs WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Rows of a table in insertion order.
    pub fn table_rows(&self, name: &str) -> Result<Vec<Vec<String>>> {
        if !self.table_exists(name)? {
            return Err(Error::failed(format!("table '{name}' does not exist")));
        }
        let raw: Vec<String> = self.db.with_conn(|conn| {
            check_ident(name)?;
            let mut stmt =
                conn.prepare(&format!("SELECT v FROM tbl_{name} ORDER BY k ASC"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;
        Ok(raw
            .into_iter()
            .map(|v| serde_json::from_str(&v).unwrap_or_default())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::LogEntry;
    use super::*;

    fn open() -> (tempfile::TempDir, Tablespace) {
        let dir = tempfile::tempdir().unwrap();
        let space = Tablespace::open(dir.path(), Uuid::new_v4()).unwrap();
        (dir, space)
    }

    #[test]
    fn row_op_codec_roundtrip() {
        let op = RowOp::InsertRow { table: "users".into(), values: vec!["ada".into()] };
        assert_eq!(RowOp::decode(&op.encode()).unwrap(), op);
        assert!(RowOp::decode(b"not json").is_err());
    }

    #[test]
    fn local_mutations_go_through_the_log() {
        let (_dir, space) = open();

        space.create_table("users", &["name".into()]).unwrap();
        space.insert_row("users", &["ada".into()]).unwrap();

        // Not visible until the log is applied.
        assert!(!space.table_exists("users").unwrap());

        let log = space.trlog(space.local_origin()).unwrap();
        assert_eq!(log.top(), 2);
        let n = log.apply(10, |payload| space.apply_op(payload)).unwrap();
        assert_eq!(n, 2);

        assert!(space.table_exists("users").unwrap());
        assert_eq!(space.table_rows("users").unwrap(), vec![vec!["ada".to_string()]]);
    }

    #[test]
    fn insert_into_missing_table_halts_until_created() {
        let (_dir, space) = open();

        let op = RowOp::InsertRow { table: "ghost".into(), values: vec![] };
        assert!(!space.apply_op(&op.encode()));

        let create = RowOp::CreateTable { name: "ghost".into(), columns: vec![] };
        assert!(space.apply_op(&create.encode()));
        assert!(space.apply_op(&op.encode()));
    }

    #[test]
    fn replicated_origin_logs_are_discovered_on_disk(){
        let dir = tempfile::tempdir().unwrap();
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();

        {
            let space = Tablespace::open(dir.path(), local).unwrap();
            let log = space.trlog(remote).unwrap();
            log.append(&[LogEntry { id: 1, payload: b"x".to_vec() }]).unwrap();
        }

        let space = Tablespace::open(dir.path(), local).unwrap();
        let origins = space.origins().unwrap();
        assert!(origins.contains(&local));
        assert!(origins.contains(&remote));

        let changed = space.changed_logs().unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].origin(), remote);
    }
}
