//! Persisted node registry: `(uuid, listen address)` pairs.
//!
//! Lives under `<root>/nodes/`. Loaded into the topology tracker at
//! startup so a restarted node can dial the cluster it already knew, and
//! upserted in the background whenever topology exchange discovers nodes.

use std::path::Path;

use rusqlite::params;
use uuid::Uuid;

use super::Db;
use crate::error::Result;

pub struct NodeStore {
    db: Db,
}

impl NodeStore {
    pub fn open(root: &Path) -> Result<Self> {
        let db = Db::open(root.join("nodes").join("nodes.db"))?;
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS nodes (
                    uuid TEXT PRIMARY KEY,
                    addr TEXT NOT NULL
                );",
            )
        })?;
        Ok(Self { db })
    }

    pub fn upsert(&self, uuid: Uuid, addr: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO nodes (uuid, addr) VALUES (?1, ?2)",
                params![uuid.to_string(), addr],
            )?;
            Ok(())
        })
    }

    pub fn upsert_all(&self, nodes: &[(Uuid, String)]) -> Result<()> {
        self.db.with_tx(|tx| {
            for (uuid, addr) in nodes {
                tx.execute(
                    "INSERT OR REPLACE INTO nodes (uuid, addr) VALUES (?1, ?2)",
                    params![uuid.to_string(), addr],
                )?;
            }
            Ok(())
        })
    }

    /// All persisted nodes. Entries with unparseable UUIDs are skipped.
    pub fn load(&self) -> Result<Vec<(Uuid, String)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT uuid, addr FROM nodes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (uuid, addr) = row?;
                if let Ok(uuid) = uuid.parse::<Uuid>() {
                    out.push((uuid, addr));
                }
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.upsert(a, "10.0.0.1:7000").unwrap();
        store.upsert_all(&[(b, "10.0.0.2:7000".into()), (a, "10.0.0.1:7001".into())]).unwrap();

        let mut nodes = store.load().unwrap();
        nodes.sort_by_key(|(u, _)| *u);
        let mut expected = vec![(a, "10.0.0.1:7001".to_string()), (b, "10.0.0.2:7000".to_string())];
        expected.sort_by_key(|(u, _)| *u);
        assert_eq!(nodes, expected);
    }
}
