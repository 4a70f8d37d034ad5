//! Committer: drains the applied < top gap of every local TR-log.
//!
//! A single long-running worker. On wake it walks every log with
//! unapplied entries and feeds them, in id order, through the tablespace
//! apply function. A failing entry halts that one log until the next wake
//! (the apply is retried then); other logs keep draining.
//!
//! Wakes come from the event bus: log appends (local writes and arriving
//! replication batches) publish `LogUpdated`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::ebus::{EventBus, EventTag};
use crate::storage::Tablespace;

pub struct Committer {
    tablespace: Arc<Tablespace>,
    batch_size: usize,
    notify: Notify,
    active: AtomicBool,
}

impl Committer {
    pub fn new(tablespace: Arc<Tablespace>, batch_size: usize) -> Arc<Committer> {
        Arc::new(Committer {
            tablespace,
            batch_size,
            notify: Notify::new(),
            active: AtomicBool::new(false),
        })
    }

    /// Wake on every log append.
    pub fn attach(self: Arc<Self>, ebus: &EventBus) {
        ebus.subscribe(EventTag::LogUpdated, move |_| {
            self.wake();
        });
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        self.active.store(true, Ordering::Release);
        loop {
            self.notify.notified().await;
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            self.drain();
        }
    }

    fn drain(&self) {
        let logs = match self.tablespace.changed_logs() {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!("log scan failed: {e}");
                return;
            }
        };

        for log in logs {
            loop {
                match log.apply(self.batch_size, |payload| self.tablespace.apply_op(payload)) {
                    // A short batch means the log is drained or an entry
                    // failed; either way this log waits for the next wake.
                    Ok(n) if n < self.batch_size => {
                        if n > 0 {
                            tracing::debug!(origin = %log.origin(), applied = log.applied(), "log applied");
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(origin = %log.origin(), "apply failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebus::Event;
    use crate::storage::RowOp;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn log_updated_event_drives_commit() {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(Tablespace::open(dir.path(), Uuid::new_v4()).unwrap());
        let ebus = EventBus::new();

        let committer = Committer::new(space.clone(), 8);
        committer.clone().attach(&ebus);
        let task = tokio::spawn(committer.clone().run());

        space.create_table("events", &[]).unwrap();
        space.insert_row("events", &["one".into()]).unwrap();
        ebus.publish(&Event::LogUpdated { origin: space.local_origin() });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !space.table_exists("events").unwrap() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("committer should apply the log");

        assert_eq!(space.table_rows("events").unwrap(), vec![vec!["one".to_string()]]);
        let log = space.trlog(space.local_origin()).unwrap();
        assert_eq!(log.applied(), 2);

        committer.stop();
        let _ = task.await;
    }
}
