//! Data synchronizer: pulls remote TR-logs along the routing table.
//!
//! A dedicated task waits for a start signal (or the periodic re-sync
//! tick), snapshots the routing table and enqueues one sync job per route
//! into the job scheduler. Each job pulls the tail of one origin's log
//! from the next-hop peer: send our known top, append the entries the
//! reply carries, and keep pulling while replies come back full.
//!
//! Routes are recomputed on every topology change; the same event wakes
//! the task so replication starts as soon as connectivity appears. At most
//! one job per (origin, next-hop) runs at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::ebus::{Event, EventBus, EventTag};
use crate::error::Result;
use crate::jobber::Jobber;
use crate::peer::SessionRegistry;
use crate::proto;
use crate::routes;
use crate::storage::{LogEntry, Tablespace};
use crate::tracker::Tracker;

pub struct DataSync {
    local_uuid: Uuid,
    tracker: Arc<Tracker>,
    registry: Arc<SessionRegistry>,
    tablespace: Arc<Tablespace>,
    jobber: Arc<Jobber>,
    ebus: Arc<EventBus>,
    batch_size: usize,
    send_timeout: Duration,
    sync_interval: Duration,
    /// origin uuid -> next-hop peer local id.
    routes: Mutex<HashMap<Uuid, u32>>,
    inflight: Arc<Mutex<HashSet<(Uuid, u32)>>>,
    notify: Notify,
    active: AtomicBool,
}

impl DataSync {
    pub fn new(
        tracker: Arc<Tracker>,
        registry: Arc<SessionRegistry>,
        tablespace: Arc<Tablespace>,
        jobber: Arc<Jobber>,
        ebus: Arc<EventBus>,
        batch_size: usize,
        send_timeout: Duration,
        sync_interval: Duration,
    ) -> Arc<DataSync> {
        Arc::new(DataSync {
            local_uuid: tracker.local_uuid(),
            tracker,
            registry,
            tablespace,
            jobber,
            ebus,
            batch_size,
            send_timeout,
            sync_interval,
            routes: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            notify: Notify::new(),
            active: AtomicBool::new(false),
        })
    }

    /// Recompute routes and restart synchronization whenever the topology
    /// changes.
    pub fn attach(self: Arc<Self>) {
        let ebus = self.ebus.clone();
        ebus.subscribe(EventTag::TopologyChanged, move |_| {
            self.update_routes();
            self.start();
        });
    }

    /// Rebuild the routing table from the current topology snapshot.
    pub fn update_routes(&self) {
        let topology = self.tracker.topology();
        let hops = routes::next_hops(&topology, self.local_uuid);

        let mut table = HashMap::new();
        for (dest, hop) in hops {
            if dest == self.local_uuid {
                continue;
            }
            if let Some(local_id) = self.tracker.local_id_of(hop) {
                table.insert(dest, local_id);
            }
        }

        tracing::debug!(routes = table.len(), "routing table updated");
        *self.routes.lock() = table;
    }

    /// Snapshot of the routing table.
    pub fn routes(&self) -> HashMap<Uuid, u32> {
        self.routes.lock().clone()
    }

    /// Signal the synchronizer to run a round.
    pub fn start(&self) {
        self.notify.notify_one();
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        self.active.store(true, Ordering::Release);
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.sync_interval) => {}
            }
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            self.clone().round();
        }
    }

    /// Enqueue one sync job per route, skipping pairs already in flight.
    fn round(self: Arc<Self>) {
        let table = self.routes();
        for (origin, peer_id) in table {
            if origin == self.local_uuid {
                continue;
            }
            let key = (origin, peer_id);
            if !self.inflight.lock().insert(key) {
                continue;
            }
            let guard = InflightGuard { set: self.inflight.clone(), key };
            let ds = self.clone();
            if self
                .jobber
                .push(u64::from(peer_id), Box::pin(sync_job(ds, origin, peer_id, guard)))
                .is_err()
            {
                // The guard drop frees the slot; the next round retries.
                tracing::warn!(%origin, peer_id, "sync job not scheduled");
            }
        }
    }
}

struct InflightGuard {
    set: Arc<Mutex<HashSet<(Uuid, u32)>>>,
    key: (Uuid, u32),
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Pull `origin`'s log tail from the peer with `peer_id` until a reply
/// comes back smaller than a full batch.
async fn sync_job(ds: Arc<DataSync>, origin: Uuid, peer_id: u32, guard: InflightGuard) {
    let _guard = guard;

    loop {
        if !ds.active.load(Ordering::Acquire) {
            break;
        }
        let Some(session) = ds.registry.by_local_id(peer_id) else {
            break;
        };

        let full = match pull_once(&ds, &session, origin).await {
            Ok(full) => full,
            Err(e) => {
                tracing::debug!(%origin, peer_id, "sync pull failed: {e}");
                break;
            }
        };
        if !full {
            break;
        }
    }
}

/// One request/append cycle. Returns true when the reply was a full batch,
/// meaning more entries are probably waiting.
async fn pull_once(
    ds: &DataSync,
    session: &Arc<crate::peer::PeerSession>,
    origin: Uuid,
) -> Result<bool> {
    let log = ds.tablespace.trlog(origin)?;
    let known_top = log.top();

    let data = session.send_log_state(origin, known_top, ds.send_timeout).await?;
    if data.entries.is_empty() {
        return Ok(false);
    }

    let mut entries = Vec::with_capacity(data.entries.len());
    for doc in &data.entries {
        entries.push(LogEntry { id: doc.id, payload: proto::blob_decode(&doc.payload)? });
    }
    let count = entries.len();
    log.append(&entries)?;

    tracing::debug!(%origin, count, top = log.top(), "log entries replicated");
    ds.ebus.publish(&Event::LogUpdated { origin });

    Ok(count >= ds.batch_size)
}
