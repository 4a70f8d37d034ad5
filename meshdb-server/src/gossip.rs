//! Link-state gossip: flooding with duplicate suppression.
//!
//! A link change is authored once by an endpoint of the link and flooded
//! peer to peer. Each message carries a per-source monotone sequence;
//! `(source, seq)` pairs already seen inside a bounded window are dropped,
//! which both rejects stale updates and terminates the flood. A message
//! is never forwarded back to the peer it came from nor to the endpoints
//! it concerns, so each assertion crosses every link at most twice.
//!
//! When a linkstate mentions a UUID this node has never seen, a previously
//! isolated segment just became reachable: a full topology exchange with
//! the introducing peer fills in the rest of that segment's links.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::CoreCtx;
use crate::error::Result;
use crate::peer::PeerSession;
use crate::proto::{self, LinkState};

/// How long a `(source, seq)` pair suppresses duplicates.
const SEEN_WINDOW: Duration = Duration::from_secs(60);

pub struct Gossip {
    local_uuid: Uuid,
    /// Our own link-state sequence, monotone for the process lifetime.
    seq: AtomicU32,
    seen: Mutex<HashMap<(Uuid, u32), Instant>>,
}

impl Gossip {
    pub fn new(local_uuid: Uuid) -> Arc<Gossip> {
        Arc::new(Gossip {
            local_uuid,
            seq: AtomicU32::new(0),
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// Record `(source, seq)`. Returns true the first time inside the
    /// window; expired pairs are pruned on the way.
    fn observe(&self, source: Uuid, seq: u32) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < SEEN_WINDOW);
        match seen.entry((source, seq)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Author and flood a link assertion about one of our own links.
    /// The concerned endpoint is excluded: it learned about the link
    /// first-hand.
    pub async fn broadcast_link(
        &self,
        ctx: &CoreCtx,
        peer: Uuid,
        peer_addr: &str,
        connected: bool,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (src_hi, src_lo) = proto::uuid_halves(self.local_uuid);
        let (peer_hi, peer_lo) = proto::uuid_halves(peer);
        let msg = LinkState {
            src_hi,
            src_lo,
            peer_hi,
            peer_lo,
            src_addr: ctx.announce_addr(),
            peer_addr: peer_addr.to_string(),
            connected,
            seq,
        };

        // Our own assertion goes into the seen set so an echo is dropped.
        self.observe(self.local_uuid, seq);
        self.flood(ctx, &msg, &[self.local_uuid, peer]).await;
    }

    /// Process a received linkstate.
    pub async fn handle(
        &self,
        ctx: &CoreCtx,
        msg: &LinkState,
        from: &Arc<PeerSession>,
    ) -> Result<()> {
        let source = msg.source();
        let peer = msg.peer();

        if !self.observe(source, msg.seq) {
            tracing::debug!(%source, seq = msg.seq, "duplicate linkstate dropped");
            return Ok(());
        }

        let (new_uuids, changed) = ctx.tracker.apply_linkstate(
            (source, &msg.src_addr),
            (peer, &msg.peer_addr),
            msg.connected,
        );
        tracing::debug!(
            %source, %peer,
            connected = msg.connected,
            seq = msg.seq,
            changed,
            "linkstate applied"
        );

        if !new_uuids.is_empty() {
            let mut nodes = Vec::new();
            if new_uuids.contains(&source) && !msg.src_addr.is_empty() {
                nodes.push((source, msg.src_addr.clone()));
            }
            if new_uuids.contains(&peer) && !msg.peer_addr.is_empty() {
                nodes.push((peer, msg.peer_addr.clone()));
            }
            if !nodes.is_empty() {
                let store = ctx.node_store.clone();
                let _ = ctx.jobber.push(
                    u64::from(msg.seq),
                    Box::pin(async move {
                        if let Err(e) = store.upsert_all(&nodes) {
                            tracing::warn!("node persistence failed: {e}");
                        }
                    }),
                );
            }
        }

        // Forward to everyone who did not already see it first-hand.
        let mut exclude = vec![source, peer];
        if let Some(sender) = from.remote_uuid() {
            exclude.push(sender);
        }
        self.flood(ctx, msg, &exclude).await;

        // Segment merge: an unknown UUID appeared, so pull the full
        // topology from the peer that introduced it.
        if !new_uuids.is_empty() {
            let session = from.clone();
            let _ = ctx.jobber.push(
                u64::from(msg.seq),
                Box::pin(async move {
                    if let Err(e) = session.toposync_exchange().await {
                        tracing::debug!("segment merge toposync failed: {e}");
                    }
                }),
            );
        }

        Ok(())
    }

    async fn flood(&self, ctx: &CoreCtx, msg: &LinkState, exclude: &[Uuid]) {
        for session in ctx.registry.established_sessions() {
            let Some(uuid) = session.remote_uuid() else { continue };
            if exclude.contains(&uuid) {
                continue;
            }
            if let Err(e) = session.post_linkstate(msg).await {
                // The session is on its way out; its teardown gossips the
                // link-down on its own.
                tracing::debug!(peer = %uuid, "linkstate forward failed: {e}");
            }
        }
    }
}
