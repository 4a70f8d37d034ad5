//! Core assembly: storage, scheduler, tracker, sync, commit, connections.
//!
//! Construction follows dependency order: meta store (identity) first,
//! then tablespace and node registry, then the schedulers and trackers,
//! and the connection manager last. Teardown runs in reverse and is
//! idempotent. The `Core` value is the programmatic surface: create,
//! listen, connect, shutdown, plus the table operations the client layer
//! calls into.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::committer::Committer;
use crate::config::NodeConfig;
use crate::conman::ConnMan;
use crate::datasync::DataSync;
use crate::ebus::{Event, EventBus};
use crate::error::Result;
use crate::gossip::Gossip;
use crate::jobber::{Jobber, JobberConfig};
use crate::peer::SessionRegistry;
use crate::storage::{MetaInfo, NodeStore, Tablespace};
use crate::topology::Topology;
use crate::tracker::Tracker;

/// Shared context handed to every peer session and the connection
/// manager. Everything in here is reference counted and safe to use from
/// any task.
pub struct CoreCtx {
    pub uuid: Uuid,
    /// Address announced in handshakes and gossip. Updated once the
    /// listener is bound (the configured port may be 0).
    listen_addr: RwLock<String>,
    pub version: u32,
    pub batch_size: usize,
    pub send_timeout: Duration,
    pub tracker: Arc<Tracker>,
    pub ebus: Arc<EventBus>,
    pub jobber: Arc<Jobber>,
    pub registry: Arc<SessionRegistry>,
    pub tablespace: Arc<Tablespace>,
    pub node_store: Arc<NodeStore>,
    pub gossip: Arc<Gossip>,
}

impl CoreCtx {
    pub fn announce_addr(&self) -> String {
        self.listen_addr.read().clone()
    }

    fn set_announce_addr(&self, addr: String) {
        *self.listen_addr.write() = addr;
    }
}

pub struct Core {
    config: NodeConfig,
    meta: MetaInfo,
    ctx: Arc<CoreCtx>,
    datasync: Arc<DataSync>,
    committer: Arc<Committer>,
    conman: ConnMan,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Build a node from its configuration and start the background
    /// workers. The node neither listens nor dials yet.
    pub async fn create(config: NodeConfig) -> Result<Core> {
        let meta = MetaInfo::open(&config.storage)?;
        tracing::info!(uuid = %meta.uuid, storage_version = meta.version, "storage opened");

        let tablespace = Arc::new(Tablespace::open(&config.storage, meta.uuid)?);
        let node_store = Arc::new(NodeStore::open(&config.storage)?);

        let ebus = EventBus::new();
        let jobber = Arc::new(Jobber::new(JobberConfig {
            workers: config.job_workers,
            queues: config.job_queues,
        }));

        let tracker = Tracker::new(meta.uuid, config.listen.clone(), ebus.clone());
        // A restarted node remembers the cluster it was part of.
        for (uuid, addr) in node_store.load()? {
            tracker.append(uuid, &addr, false);
        }

        let registry = SessionRegistry::new(meta.uuid);
        let gossip = Gossip::new(meta.uuid);

        let datasync = DataSync::new(
            tracker.clone(),
            registry.clone(),
            tablespace.clone(),
            jobber.clone(),
            ebus.clone(),
            config.batch_size,
            config.send_timeout(),
            config.sync_interval(),
        );
        datasync.clone().attach();

        let committer = Committer::new(tablespace.clone(), config.batch_size);
        committer.clone().attach(&ebus);

        let ctx = Arc::new(CoreCtx {
            uuid: meta.uuid,
            listen_addr: RwLock::new(config.listen.clone()),
            version: config.version,
            batch_size: config.batch_size,
            send_timeout: config.send_timeout(),
            tracker,
            ebus,
            jobber,
            registry,
            tablespace,
            node_store,
            gossip,
        });

        let conman = ConnMan::new(ctx.clone(), config.keepalive());

        let tasks = vec![
            tokio::spawn(datasync.clone().run()),
            tokio::spawn(committer.clone().run()),
        ];
        // Drain whatever the last run left unapplied.
        committer.wake();

        Ok(Core {
            config,
            meta,
            ctx,
            datasync,
            committer,
            conman,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(tasks),
        })
    }

    /// Bind the listener. Returns the actual bound address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let addr = self.conman.bind(&self.config.listen).await?;
        *self.local_addr.lock() = Some(addr);
        // Announce the real port, not the configured one.
        self.ctx.set_announce_addr(addr.to_string());
        self.ctx.tracker.append(self.meta.uuid, &addr.to_string(), false);
        tracing::info!(%addr, "listening for peers");
        Ok(addr)
    }

    /// Dial every configured seed peer.
    pub fn connect(&self) {
        for peer in &self.config.peers {
            self.connect_addr(peer.clone());
        }
    }

    /// Dial one address with reconnect.
    pub fn connect_addr(&self, addr: String) {
        self.conman.connect(addr);
    }

    /// Stop networking and background workers, then drain the job queues.
    pub async fn shutdown(&self) {
        tracing::info!("core shutting down");
        self.conman.shutdown().await;
        self.datasync.stop();
        self.committer.stop();
        for task in std::mem::take(&mut *self.tasks.lock()) {
            let _ = task.await;
        }
        self.ctx.jobber.shutdown().await;
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn uuid(&self) -> Uuid {
        self.meta.uuid
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.ctx.tracker.topology()
    }

    pub fn tracker(&self) -> Arc<Tracker> {
        self.ctx.tracker.clone()
    }

    pub fn tablespace(&self) -> Arc<Tablespace> {
        self.ctx.tablespace.clone()
    }

    pub fn ebus(&self) -> Arc<EventBus> {
        self.ctx.ebus.clone()
    }

    pub fn routes(&self) -> std::collections::HashMap<Uuid, u32> {
        self.datasync.routes()
    }

    /// Number of established peer sessions.
    pub fn connected_peers(&self) -> usize {
        self.ctx.registry.established_sessions().len()
    }

    // ── Table operations ────────────────────────────────────────

    /// Record a create-table operation and wake the committer.
    pub fn create_table(&self, name: &str, columns: &[String]) -> Result<u64> {
        let id = self.ctx.tablespace.create_table(name, columns)?;
        self.ctx.ebus.publish(&Event::LogUpdated { origin: self.meta.uuid });
        Ok(id)
    }

    /// Record an insert-row operation and wake the committer.
    pub fn insert_row(&self, table: &str, values: &[String]) -> Result<u64> {
        let id = self.ctx.tablespace.insert_row(table, values)?;
        self.ctx.ebus.publish(&Event::LogUpdated { origin: self.meta.uuid });
        Ok(id)
    }
}
