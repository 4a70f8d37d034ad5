//! Per-origin transaction log with durable top and applied cursors.
//!
//! Each origin node's operations live in their own append-only log under
//! `<root>/trlog/<origin-uuid>/`: an integer-keyed entries map plus an
//! "applied" map holding the id of the last entry committed to table state
//! (at key 0). Ids are assigned by the originating node and strictly
//! monotone per log; replicated logs may carry gaps that sync fills in
//! later.
//!
//! Cursor discipline:
//! - `top` is the largest id ever written. Initialized from the last key of
//!   the entries map, advanced by compare-and-swap on append so concurrent
//!   writers only ever move it up.
//! - `applied` trails `top` and is durable: it is re-read on open and an
//!   entry with id <= applied is never handed to the apply function again.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use super::{Db, ensure_map, map_get, map_last_key, map_put, map_put_unique, map_range_from};
use crate::error::Result;

const MAP_TRLOG: &str = "trlog";
const MAP_APPLIED: &str = "applied";
const APPLIED_POS_KEY: i64 = 0;

/// One log entry: monotone id plus an opaque row operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Transaction log of a single origin.
pub struct TrLog {
    origin: Uuid,
    db: Db,
    top: AtomicU64,
    applied: AtomicU64,
    /// Serializes `apply` so no entry is ever applied twice.
    apply_lock: Mutex<()>,
}

impl TrLog {
    /// Open (or create) the log for `origin` under `root`, restoring both
    /// cursors from storage.
    pub fn open(origin: Uuid, root: &Path) -> Result<TrLog> {
        let dir = root.join("trlog").join(origin.to_string());
        let db = Db::open(dir.join("log.db"))?;

        db.with_tx(|tx| {
            ensure_map(tx, MAP_TRLOG)?;
            ensure_map(tx, MAP_APPLIED)
        })?;

        let top = db.with_conn(|conn| map_last_key(conn, MAP_TRLOG))?.unwrap_or(0) as u64;
        let applied = db
            .with_conn(|conn| map_get(conn, MAP_APPLIED, APPLIED_POS_KEY))?
            .map(|raw| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw[..8.min(raw.len())]);
                u64::from_le_bytes(bytes)
            })
            .unwrap_or(0);

        Ok(TrLog {
            origin,
            db,
            top: AtomicU64::new(top),
            applied: AtomicU64::new(applied),
            apply_lock: Mutex::new(()),
        })
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn top(&self) -> u64 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// True when entries above the applied cursor exist.
    pub fn changed(&self) -> bool {
        self.top() > self.applied()
    }

    fn maximize_top(&self, id: u64) {
        let mut current = self.top.load(Ordering::Relaxed);
        while id > current {
            match self.top.compare_exchange_weak(current, id, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Append a batch inside one transaction. A duplicate id is a soft
    /// warning, not an error: replays of already-synced entries are no-ops.
    /// On commit failure nothing is inserted and `top` is unchanged.
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let inserted = self.db.with_tx(|tx| {
            let mut inserted = Vec::with_capacity(entries.len());
            for entry in entries {
                if map_put_unique(tx, MAP_TRLOG, entry.id as i64, &entry.payload)? {
                    inserted.push(entry.id);
                } else {
                    tracing::warn!(
                        origin = %self.origin,
                        id = entry.id,
                        "duplicate log entry ignored"
                    );
                }
            }
            Ok(inserted)
        })?;

        for id in inserted {
            self.maximize_top(id);
        }
        Ok(())
    }

    /// Append one locally originated operation, allocating the next id.
    /// The id is taken from `top` before the write; if the commit fails the
    /// cursor is not rolled back and the resulting gap is tolerated.
    pub fn append_local(&self, payload: Vec<u8>) -> Result<u64> {
        let id = self.top.fetch_add(1, Ordering::Relaxed) + 1;
        self.db.with_tx(|tx| {
            if !map_put_unique(tx, MAP_TRLOG, id as i64, &payload)? {
                tracing::warn!(origin = %self.origin, id, "local log entry id already taken");
            }
            Ok(())
        })?;
        Ok(id)
    }

    /// Up to `max` entries with id >= `from_id`, ascending.
    pub fn read(&self, from_id: u64, max: usize) -> Result<Vec<LogEntry>> {
        let rows = self
            .db
            .with_conn(|conn| map_range_from(conn, MAP_TRLOG, from_id as i64, max))?;
        Ok(rows
            .into_iter()
            .map(|(id, payload)| LogEntry { id: id as u64, payload })
            .collect())
    }

    /// Apply up to `batch_size` unapplied entries through `fn`, advancing
    /// the applied cursor past every entry for which it returns true and
    /// stopping at the first failure. The new cursor is written durably in
    /// its own transaction. Returns how many entries were applied.
    ///
    /// Calls are serialized per log, so `fn` never sees the same id twice
    /// even with concurrent callers.
    pub fn apply(&self, batch_size: usize, mut apply_fn: impl FnMut(&[u8]) -> bool) -> Result<usize> {
        let _guard = self.apply_lock.lock();

        let applied = self.applied();
        if applied >= self.top() {
            return Ok(0);
        }

        let entries = self.read(applied + 1, batch_size)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut new_applied = applied;
        let mut count = 0;
        for entry in &entries {
            if !apply_fn(&entry.payload) {
                tracing::warn!(origin = %self.origin, id = entry.id, "log entry not applied");
                break;
            }
            new_applied = entry.id;
            count += 1;
        }

        if count > 0 {
            self.db.with_tx(|tx| {
                ensure_map(tx, MAP_APPLIED)?;
                map_put(tx, MAP_APPLIED, APPLIED_POS_KEY, &new_applied.to_le_bytes())
            })?;
            self.applied.store(new_applied, Ordering::Relaxed);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn entry(id: u64, payload: &str) -> LogEntry {
        LogEntry { id, payload: payload.as_bytes().to_vec() }
    }

    #[test]
    fn empty_log_opens_with_zero_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();
        assert_eq!(log.top(), 0);
        assert_eq!(log.applied(), 0);
        assert!(!log.changed());
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();

        log.append(&[entry(1, "x"), entry(2, "y")]).unwrap();
        assert_eq!(log.top(), 2);
        assert!(log.changed());

        let got = log.read(1, usize::MAX).unwrap();
        assert_eq!(got, vec![entry(1, "x"), entry(2, "y")]);
    }

    #[test]
    fn duplicate_ids_are_soft_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();

        log.append(&[entry(1, "first")]).unwrap();
        log.append(&[entry(1, "second"), entry(2, "y")]).unwrap();

        let got = log.read(1, usize::MAX).unwrap();
        assert_eq!(got, vec![entry(1, "first"), entry(2, "y")]);
        assert_eq!(log.top(), 2);
    }

    #[test]
    fn append_local_allocates_monotone_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();

        assert_eq!(log.append_local(b"a".to_vec()).unwrap(), 1);
        assert_eq!(log.append_local(b"b".to_vec()).unwrap(), 2);
        assert_eq!(log.top(), 2);
    }

    #[test]
    fn apply_advances_cursor_and_never_replays() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();
        log.append(&[entry(1, "a"), entry(2, "b"), entry(3, "c")]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let n = log
            .apply(10, move |payload| {
                s.lock().push(payload.to_vec());
                true
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(log.applied(), 3);

        // A second run has nothing left; the apply fn is not invoked again.
        let s = seen.clone();
        let n = log
            .apply(10, move |payload| {
                s.lock().push(payload.to_vec());
                true
            })
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn apply_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();
        log.append(&[entry(1, "a"), entry(2, "bad"), entry(3, "c")]).unwrap();

        let n = log.apply(10, |payload| payload != b"bad").unwrap();
        assert_eq!(n, 1);
        assert_eq!(log.applied(), 1);

        // Entry 2 is retried on the next run.
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let n = log
            .apply(10, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.applied(), 3);
    }

    #[test]
    fn cursors_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Uuid::new_v4();

        {
            let log = TrLog::open(origin, dir.path()).unwrap();
            let entries: Vec<LogEntry> =
                (1..=100).map(|id| entry(id, &format!("op-{id}"))).collect();
            log.append(&entries).unwrap();

            let n = log.apply(40, |_| true).unwrap();
            assert_eq!(n, 40);
        }

        let log = TrLog::open(origin, dir.path()).unwrap();
        assert_eq!(log.top(), 100);
        assert_eq!(log.applied(), 40);

        // The next apply resumes from id 41.
        let first = Arc::new(Mutex::new(None));
        let f = first.clone();
        log.apply(1, move |payload| {
            *f.lock() = Some(payload.to_vec());
            true
        })
        .unwrap();
        assert_eq!(first.lock().as_deref(), Some(&b"op-41"[..]));
    }

    #[test]
    fn replicated_log_gaps_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrLog::open(Uuid::new_v4(), dir.path()).unwrap();

        log.append(&[entry(1, "a"), entry(3, "c")]).unwrap();
        assert_eq!(log.top(), 3);

        // Apply walks what exists, skipping the missing id.
        let n = log.apply(10, |_| true).unwrap();
        assert_eq!(n, 2);
        assert_eq!(log.applied(), 3);
    }
}
