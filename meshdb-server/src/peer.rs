//! Peer session: handshake, message handlers and lifetime.
//!
//! Every server-to-server connection gets one session. The outbound side
//! posts `p2p_hello` as soon as the socket is up; the inbound side answers
//! with its own hello and both sides move to established, upserting the
//! node in the tracker, gossiping the new link and (outbound only) pulling
//! a full topology sync.
//!
//! Sessions are reference counted. Handlers hold only a weak reference and
//! upgrade it per message, so a session that lost its last strong owner
//! stops processing instead of keeping itself alive through its own
//! dispatcher.
//!
//! When both ends dial each other simultaneously the duplicate is resolved
//! deterministically on both sides: the node with the lower UUID keeps its
//! outgoing session, the other keeps the incoming one. The losing session
//! is closed before it ever reaches the tracker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::CoreCtx;
use crate::dispatch::{Dispatcher, Handler, HandlerFuture};
use crate::ebus::Event;
use crate::error::{Error, Result};
use crate::proto::{
    self, Frame, Hello, LinkState, LogData, LogEntryDoc, LogState, P2P_HELLO, P2P_LINKSTATE,
    P2P_LOG_DATA, P2P_LOG_STATE, P2P_TOPODIFF, P2P_TOPOSYNC, TopologyDoc,
};
use crate::storage::LogEntry;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

const WRITE_QUEUE_DEPTH: usize = 256;

pub struct PeerSession {
    ctx: Arc<CoreCtx>,
    dispatcher: Arc<Dispatcher>,
    direction: Direction,
    peer_addr: Option<SocketAddr>,
    remote_uuid: Mutex<Option<Uuid>>,
    remote_listen: Mutex<Option<String>>,
    local_id: AtomicU32,
    established: AtomicBool,
    closing: AtomicBool,
    shutdown: Notify,
}

impl PeerSession {
    /// Take ownership of a fresh socket and drive it until it closes.
    /// Returns the session and the handle of its read task; the handle
    /// resolves when the session is fully torn down.
    pub fn spawn(
        stream: TcpStream,
        direction: Direction,
        ctx: Arc<CoreCtx>,
    ) -> (Arc<PeerSession>, JoinHandle<()>) {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = proto::write_frame(&mut write_half, &frame).await {
                    tracing::debug!("peer writer stopped: {e}");
                    break;
                }
            }
        });

        let session = Arc::new(PeerSession {
            ctx,
            dispatcher: Dispatcher::new(writer_tx),
            direction,
            peer_addr,
            remote_uuid: Mutex::new(None),
            remote_listen: Mutex::new(None),
            local_id: AtomicU32::new(u32::MAX),
            established: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        Self::register_handlers(&session);

        let handle = tokio::spawn(session.clone().run(read_half, writer));
        (session, handle)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_uuid(&self) -> Option<Uuid> {
        *self.remote_uuid.lock()
    }

    pub fn local_id(&self) -> Option<u32> {
        match self.local_id.load(Ordering::Relaxed) {
            u32::MAX => None,
            id => Some(id),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Begin teardown. Pending sends fail with `Closed`, the read loop
    /// wakes and the session unwinds on its own task.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.close();
        self.shutdown.notify_one();
    }

    // ── Outbound traffic ────────────────────────────────────────

    pub async fn post_linkstate(&self, msg: &LinkState) -> Result<()> {
        self.log_send(P2P_LINKSTATE);
        self.dispatcher.post(P2P_LINKSTATE, proto::encode(msg)).await
    }

    /// Pull entries of `origin`'s log above `top` from this peer.
    pub async fn send_log_state(
        &self,
        origin: Uuid,
        top: u64,
        timeout: std::time::Duration,
    ) -> Result<LogData> {
        self.log_send(P2P_LOG_STATE);
        let req = LogState::new(origin, top);
        let resp = self
            .dispatcher
            .send(P2P_LOG_STATE, proto::encode(&req), timeout)
            .await?;
        proto::decode(&resp)
    }

    /// Exchange topologies with this peer: send ours, apply the links the
    /// reply says we lack.
    pub async fn toposync_exchange(self: Arc<Self>) -> Result<()> {
        let doc = self.ctx.tracker.topology().to_doc();
        self.log_send(P2P_TOPOSYNC);
        let resp = self
            .dispatcher
            .send(P2P_TOPOSYNC, proto::encode(&doc), self.ctx.send_timeout)
            .await?;
        let diff: TopologyDoc = proto::decode(&resp)?;
        self.apply_topology(&diff)
    }

    fn log_send(&self, id: u32) {
        tracing::debug!(
            peer = ?self.peer_addr,
            uuid = ?self.remote_uuid(),
            msg = proto::msg_name(id),
            "send"
        );
    }

    // ── Read loop ───────────────────────────────────────────────

    async fn run(self: Arc<Self>, mut read_half: OwnedReadHalf, writer: JoinHandle<()>) {
        if self.direction == Direction::Outbound {
            let hello = Hello::new(self.ctx.version, self.ctx.uuid, self.ctx.announce_addr());
            self.log_send(P2P_HELLO);
            if let Err(e) = self.dispatcher.post(P2P_HELLO, proto::encode(&hello)).await {
                tracing::warn!(peer = ?self.peer_addr, "handshake post failed: {e}");
                self.close();
            }
        }

        while !self.is_closed() {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                res = proto::read_frame(&mut read_half) => match res {
                    Ok(frame) => {
                        tracing::debug!(
                            peer = ?self.peer_addr,
                            msg = proto::msg_name(frame.id),
                            "recv"
                        );
                        if let Err(e) = self.dispatcher.dispatch(frame).await {
                            match e {
                                // Malformed payload: drop the message, keep
                                // the connection.
                                Error::InvalidMessage(m) => {
                                    tracing::warn!(peer = ?self.peer_addr, "dropped message: {m}");
                                }
                                Error::InvalidVersion { got, expected } => {
                                    tracing::warn!(
                                        peer = ?self.peer_addr,
                                        got, expected,
                                        "handshake version mismatch"
                                    );
                                    break;
                                }
                                e => {
                                    tracing::debug!(peer = ?self.peer_addr, "handler failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(Error::Closed) => break,
                    Err(e) => {
                        tracing::warn!(peer = ?self.peer_addr, "read failed: {e}");
                        break;
                    }
                },
            }
        }

        // Teardown. Everything below must run exactly once; `close` makes
        // later dispatch attempts fail fast.
        self.close();
        writer.abort();

        if self.established.swap(false, Ordering::SeqCst) {
            if let Some(uuid) = self.remote_uuid() {
                if self.ctx.registry.remove(uuid, &self) {
                    tracing::info!(peer = %uuid, "peer disconnected");
                    self.ctx.tracker.peer_disconnected(uuid);
                    let listen = self.remote_listen.lock().clone().unwrap_or_default();
                    self.ctx
                        .gossip
                        .broadcast_link(&self.ctx, uuid, &listen, false)
                        .await;
                }
            }
        }
    }

    // ── Handlers ────────────────────────────────────────────────

    fn register_handlers(session: &Arc<PeerSession>) {
        let d = session.dispatcher.clone();
        d.register(P2P_HELLO, handler(session, |s, f| s.on_hello(f)));
        d.register(P2P_LINKSTATE, handler(session, |s, f| s.on_linkstate(f)));
        d.register(P2P_TOPOSYNC, handler(session, |s, f| s.on_toposync(f)));
        d.register(P2P_TOPODIFF, handler(session, |s, f| s.on_topodiff(f)));
        d.register(P2P_LOG_STATE, handler(session, |s, f| s.on_log_state(f)));
        d.register(P2P_LOG_DATA, handler(session, |s, f| s.on_log_data(f)));
    }

    async fn on_hello(self: Arc<Self>, frame: Frame) -> Result<()> {
        let hello: Hello = proto::decode(&frame)?;

        if hello.version != self.ctx.version {
            self.close();
            return Err(Error::InvalidVersion {
                got: hello.version,
                expected: self.ctx.version,
            });
        }

        let uuid = hello.uuid();
        *self.remote_uuid.lock() = Some(uuid);
        *self.remote_listen.lock() = Some(hello.listen.clone());

        if self.direction == Direction::Inbound {
            let ours = Hello::new(self.ctx.version, self.ctx.uuid, self.ctx.announce_addr());
            self.log_send(P2P_HELLO);
            self.dispatcher
                .reply(P2P_HELLO, frame.seq, proto::encode(&ours))
                .await?;
        }

        self.establish(uuid, hello.listen).await
    }

    async fn establish(self: Arc<Self>, uuid: Uuid, listen: String) -> Result<()> {
        if self.established.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.ctx.registry.insert(uuid, &self) == InsertOutcome::Duplicate {
            tracing::info!(peer = %uuid, "duplicate session, closing");
            self.established.store(false, Ordering::SeqCst);
            self.close();
            return Ok(());
        }

        let accepted = self.direction == Direction::Inbound;
        let (local_id, _) = self.ctx.tracker.peer_connected(uuid, &listen, accepted);
        self.local_id.store(local_id, Ordering::Relaxed);
        self.ctx.registry.bind(local_id, &listen, uuid, &self);

        tracing::info!(peer = %uuid, local_id, direction = ?self.direction, "peer connected");

        // Persist the peer's address off the hot path.
        let store = self.ctx.node_store.clone();
        let addr = listen.clone();
        let _ = self.ctx.jobber.push(
            u64::from(local_id),
            Box::pin(async move {
                if let Err(e) = store.upsert(uuid, &addr) {
                    tracing::warn!("node persistence failed: {e}");
                }
            }),
        );

        // Everyone except the new peer itself learns about the link.
        self.ctx
            .gossip
            .broadcast_link(&self.ctx, uuid, &listen, true)
            .await;

        if self.direction == Direction::Outbound {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.toposync_exchange().await {
                    tracing::debug!("toposync failed: {e}");
                }
            });
        }

        Ok(())
    }

    async fn on_linkstate(self: Arc<Self>, frame: Frame) -> Result<()> {
        let msg: LinkState = proto::decode(&frame)?;
        let gossip = self.ctx.gossip.clone();
        gossip.handle(&self.ctx, &msg, &self).await
    }

    /// A peer offered its topology: answer with the links it lacks and
    /// adopt the links we lack.
    async fn on_toposync(self: Arc<Self>, frame: Frame) -> Result<()> {
        let doc: TopologyDoc = proto::decode(&frame)?;
        let remote = Topology::from_doc(&doc)?;
        let local = self.ctx.tracker.topology();

        let (only_local, only_remote) = local.diff(&remote);

        let reply = local.restrict(&only_local).to_doc();
        self.log_send(P2P_TOPODIFF);
        self.dispatcher
            .reply(P2P_TOPODIFF, frame.seq, proto::encode(&reply))
            .await?;

        let sub = remote.restrict(&only_remote);
        self.adopt(&sub);
        Ok(())
    }

    /// Unsolicited topodiff; the usual path is the reply side of
    /// `toposync_exchange`.
    async fn on_topodiff(self: Arc<Self>, frame: Frame) -> Result<()> {
        let doc: TopologyDoc = proto::decode(&frame)?;
        self.apply_topology(&doc)
    }

    fn apply_topology(&self, doc: &TopologyDoc) -> Result<()> {
        let topo = Topology::from_doc(doc)?;
        self.adopt(&topo);
        Ok(())
    }

    /// Merge a received topology fragment into the tracker and persist the
    /// nodes it introduced.
    fn adopt(&self, topo: &Topology) {
        if topo.nodes.is_empty() && topo.links.is_empty() {
            return;
        }
        let new = self.ctx.tracker.apply_links(&topo.nodes, &topo.links);
        if new.is_empty() {
            return;
        }

        let nodes: Vec<(Uuid, String)> = topo
            .nodes
            .iter()
            .filter(|n| new.contains(&n.uuid))
            .map(|n| (n.uuid, n.addr.clone()))
            .collect();
        let store = self.ctx.node_store.clone();
        let _ = self.ctx.jobber.push(
            nodes.len() as u64,
            Box::pin(async move {
                if let Err(e) = store.upsert_all(&nodes) {
                    tracing::warn!("node persistence failed: {e}");
                }
            }),
        );
    }

    /// A peer asks for entries of some origin's log above its known top.
    async fn on_log_state(self: Arc<Self>, frame: Frame) -> Result<()> {
        let req: LogState = proto::decode(&frame)?;
        let origin = req.origin();

        let log = self.ctx.tablespace.trlog(origin)?;
        let entries = log.read(req.top + 1, self.ctx.batch_size)?;

        let (origin_hi, origin_lo) = proto::uuid_halves(origin);
        let data = LogData {
            origin_hi,
            origin_lo,
            entries: entries
                .iter()
                .map(|e| LogEntryDoc { id: e.id, payload: proto::blob_encode(&e.payload) })
                .collect(),
        };
        self.log_send(P2P_LOG_DATA);
        self.dispatcher
            .reply(P2P_LOG_DATA, frame.seq, proto::encode(&data))
            .await
    }

    /// Entries pushed without a preceding request are appended all the
    /// same; duplicate ids are no-ops so replays converge.
    async fn on_log_data(self: Arc<Self>, frame: Frame) -> Result<()> {
        let data: LogData = proto::decode(&frame)?;
        let origin = data.origin();

        let mut entries = Vec::with_capacity(data.entries.len());
        for doc in &data.entries {
            entries.push(LogEntry { id: doc.id, payload: proto::blob_decode(&doc.payload)? });
        }
        if entries.is_empty() {
            return Ok(());
        }

        self.ctx.tablespace.trlog(origin)?.append(&entries)?;
        self.ctx.ebus.publish(&Event::LogUpdated { origin });
        Ok(())
    }
}

/// Wrap a session method as a dispatcher handler holding only a weak
/// reference. A dead session ignores the message.
fn handler<F, Fut>(session: &Arc<PeerSession>, f: F) -> Handler
where
    F: Fn(Arc<PeerSession>, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let weak = Arc::downgrade(session);
    Arc::new(move |frame: Frame| {
        let fut: HandlerFuture = match weak.upgrade() {
            Some(session) => Box::pin(f(session, frame)),
            None => Box::pin(async { Ok(()) }),
        };
        fut
    })
}

// ── Session registry ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Kept,
    Duplicate,
}

/// Live sessions keyed by remote UUID, with the local-id lookup the
/// tracker's node records point at. The registry holds the only long-lived
/// strong references to sessions; the local-id index is weak and upgraded
/// on demand.
pub struct SessionRegistry {
    local_uuid: Uuid,
    by_uuid: Mutex<HashMap<Uuid, Arc<PeerSession>>>,
    by_local_id: Mutex<HashMap<u32, Weak<PeerSession>>>,
    addr_to_uuid: Mutex<HashMap<String, Uuid>>,
}

impl SessionRegistry {
    pub fn new(local_uuid: Uuid) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry {
            local_uuid,
            by_uuid: Mutex::new(HashMap::new()),
            by_local_id: Mutex::new(HashMap::new()),
            addr_to_uuid: Mutex::new(HashMap::new()),
        })
    }

    /// Admit a session for `uuid`, resolving simultaneous dials. The node
    /// with the lower UUID keeps its outgoing session; the loser is told
    /// `Duplicate` and closes itself.
    pub fn insert(&self, uuid: Uuid, session: &Arc<PeerSession>) -> InsertOutcome {
        let evicted = {
            let mut map = self.by_uuid.lock();
            let replaces = match map.get(&uuid) {
                Some(existing) if !existing.is_closed() => {
                    let keep = if self.local_uuid < uuid {
                        Direction::Outbound
                    } else {
                        Direction::Inbound
                    };
                    if session.direction() == keep && !Arc::ptr_eq(existing, session) {
                        true
                    } else {
                        return InsertOutcome::Duplicate;
                    }
                }
                _ => false,
            };
            let old = map.insert(uuid, session.clone());
            if replaces { old } else { None }
        };
        if let Some(old) = evicted {
            tracing::info!(peer = %uuid, "replacing duplicate session");
            old.close();
        }
        InsertOutcome::Kept
    }

    /// Index an established session by local id and learned address.
    pub fn bind(&self, local_id: u32, addr: &str, uuid: Uuid, session: &Arc<PeerSession>) {
        self.by_local_id.lock().insert(local_id, Arc::downgrade(session));
        if !addr.is_empty() {
            self.addr_to_uuid.lock().insert(addr.to_string(), uuid);
        }
    }

    /// Drop the session for `uuid`, but only if it is the same session the
    /// caller owns. A replacement that won the tie-break stays put.
    pub fn remove(&self, uuid: Uuid, session: &Arc<PeerSession>) -> bool {
        let mut map = self.by_uuid.lock();
        let owns_entry = map
            .get(&uuid)
            .is_some_and(|existing| Arc::ptr_eq(existing, session));
        if !owns_entry {
            return false;
        }
        map.remove(&uuid);
        drop(map);
        if let Some(id) = session.local_id() {
            self.by_local_id.lock().remove(&id);
        }
        true
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<PeerSession>> {
        self.by_uuid.lock().get(&uuid).cloned()
    }

    pub fn by_local_id(&self, local_id: u32) -> Option<Arc<PeerSession>> {
        let mut map = self.by_local_id.lock();
        let session = map.get(&local_id).and_then(Weak::upgrade);
        if session.is_none() {
            map.remove(&local_id);
        }
        session
    }

    pub fn uuid_for_addr(&self, addr: &str) -> Option<Uuid> {
        self.addr_to_uuid.lock().get(addr).copied()
    }

    pub fn established_sessions(&self) -> Vec<Arc<PeerSession>> {
        self.by_uuid
            .lock()
            .values()
            .filter(|s| s.is_established())
            .cloned()
            .collect()
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = self.by_uuid.lock().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }
}
