//! Node registry and cluster graph tracker.
//!
//! Owns every node record and link this process has ever heard of. All
//! mutations happen under one exclusive lock and each mutating batch ends
//! by publishing a fresh immutable topology snapshot plus a
//! `TopologyChanged` event, so readers and subscribers always observe a
//! consistent graph.
//!
//! Node records are created on first mention and never destroyed;
//! reachability transitions only flip their flags. The `local_id` is a
//! process-lifetime dense integer handed out on first sight, used to key
//! the session registry and routing tables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::ebus::{Event, EventBus};
use crate::topology::{TopoLink, TopoNode, Topology};

/// Everything known about one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub uuid: Uuid,
    /// Announced listen address, empty until learned.
    pub addr: String,
    pub local_id: u32,
    /// True when this node dialed us (inbound), false when we dialed it.
    pub accepted: bool,
    /// Current reachability from this node.
    pub connected: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Copy)]
struct LinkRecord {
    weight: u32,
    up: bool,
}

#[derive(Default)]
struct State {
    nodes: HashMap<Uuid, NodeRecord>,
    links: HashMap<(Uuid, Uuid), LinkRecord>,
    by_id: HashMap<u32, Uuid>,
    next_id: u32,
}

impl State {
    fn upsert_node(&mut self, uuid: Uuid, addr: &str, accepted: Option<bool>, connected: Option<bool>) -> (u32, bool) {
        if let Some(record) = self.nodes.get_mut(&uuid) {
            if !addr.is_empty() {
                record.addr = addr.to_string();
            }
            if let Some(accepted) = accepted {
                record.accepted = accepted;
            }
            if let Some(connected) = connected {
                record.connected = connected;
            }
            return (record.local_id, false);
        }

        let local_id = self.next_id;
        self.next_id += 1;
        self.by_id.insert(local_id, uuid);
        self.nodes.insert(uuid, NodeRecord {
            uuid,
            addr: addr.to_string(),
            local_id,
            accepted: accepted.unwrap_or(false),
            connected: connected.unwrap_or(false),
            active: true,
        });
        (local_id, true)
    }

    fn set_link(&mut self, a: Uuid, b: Uuid, weight: u32, up: bool) -> bool {
        let key = if a <= b { (a, b) } else { (b, a) };
        match self.links.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let link = slot.get_mut();
                let changed = link.up != up || link.weight != weight;
                link.up = up;
                link.weight = weight;
                changed
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(LinkRecord { weight, up });
                up
            }
        }
    }

    fn snapshot(&self) -> Arc<Topology> {
        let nodes = self
            .nodes
            .values()
            .map(|n| TopoNode { uuid: n.uuid, addr: n.addr.clone() })
            .collect();
        let links = self
            .links
            .iter()
            .filter(|(_, l)| l.up)
            .map(|((a, b), l)| TopoLink::new(*a, *b, l.weight))
            .collect();
        Topology::new(nodes, links)
    }
}

pub struct Tracker {
    local_uuid: Uuid,
    state: RwLock<State>,
    current: Mutex<Arc<Topology>>,
    ebus: Arc<EventBus>,
}

impl Tracker {
    pub fn new(local_uuid: Uuid, local_addr: String, ebus: Arc<EventBus>) -> Arc<Tracker> {
        let mut state = State::default();
        state.upsert_node(local_uuid, &local_addr, None, Some(true));
        let current = Mutex::new(state.snapshot());
        Arc::new(Tracker { local_uuid, state: RwLock::new(state), current, ebus })
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.current.lock().clone()
    }

    fn publish(&self, snapshot: Arc<Topology>) {
        *self.current.lock() = snapshot.clone();
        self.ebus.publish(&Event::TopologyChanged { topology: snapshot });
    }

    /// Upsert a node record. Returns true iff the UUID was new. Publishes
    /// `TopologyChanged` when `notify` is set and something was learned.
    pub fn append(&self, uuid: Uuid, addr: &str, notify: bool) -> bool {
        let (snapshot, new) = {
            let mut state = self.state.write();
            let (_, new) = state.upsert_node(uuid, addr, None, None);
            (state.snapshot(), new)
        };
        if notify && new {
            self.publish(snapshot);
        }
        new
    }

    /// Record an established peer session: upsert the node as connected,
    /// assign its local id and bring the direct link up.
    pub fn peer_connected(&self, uuid: Uuid, addr: &str, accepted: bool) -> (u32, bool) {
        let (snapshot, local_id, new) = {
            let mut state = self.state.write();
            let (local_id, new) = state.upsert_node(uuid, addr, Some(accepted), Some(true));
            state.set_link(self.local_uuid, uuid, 1, true);
            (state.snapshot(), local_id, new)
        };
        self.publish(snapshot);
        self.ebus.publish(&Event::PeerConnected { uuid, local_id });
        (local_id, new)
    }

    /// Record a peer session teardown: the node becomes unreachable and the
    /// direct link goes down.
    pub fn peer_disconnected(&self, uuid: Uuid) {
        let snapshot = {
            let mut state = self.state.write();
            if let Some(record) = state.nodes.get_mut(&uuid) {
                record.connected = false;
            }
            state.set_link(self.local_uuid, uuid, 1, false);
            state.snapshot()
        };
        self.publish(snapshot);
        self.ebus.publish(&Event::PeerDisconnected { uuid });
    }

    /// Idempotent link update, symmetric in its endpoints. Returns true
    /// when the tracker state actually changed.
    pub fn linkstate(&self, a: Uuid, b: Uuid, up: bool) -> bool {
        let (snapshot, changed) = {
            let mut state = self.state.write();
            state.upsert_node(a, "", None, None);
            state.upsert_node(b, "", None, None);
            let changed = state.set_link(a, b, 1, up);
            (state.snapshot(), changed)
        };
        if changed {
            self.publish(snapshot);
        }
        changed
    }

    /// Apply a gossiped link assertion in one batch: upsert both endpoint
    /// records (with addresses) and update the link. Returns the newly
    /// discovered UUIDs and whether the link changed.
    pub fn apply_linkstate(
        &self,
        source: (Uuid, &str),
        peer: (Uuid, &str),
        up: bool,
    ) -> (Vec<Uuid>, bool) {
        let (snapshot, new_uuids, changed) = {
            let mut state = self.state.write();
            let mut new_uuids = Vec::new();
            for (uuid, addr) in [source, peer] {
                let (_, new) = state.upsert_node(uuid, addr, None, None);
                if new {
                    new_uuids.push(uuid);
                }
            }
            let changed = state.set_link(source.0, peer.0, 1, up);
            (state.snapshot(), new_uuids, changed)
        };
        if changed || !new_uuids.is_empty() {
            self.publish(snapshot);
        }
        (new_uuids, changed)
    }

    /// Apply a batch of links from topology exchange: every endpoint node
    /// is upserted with its address and every link marked up. Returns the
    /// newly discovered UUIDs.
    pub fn apply_links(&self, nodes: &[TopoNode], links: &[TopoLink]) -> Vec<Uuid> {
        if nodes.is_empty() && links.is_empty() {
            return Vec::new();
        }
        let (snapshot, new_uuids, changed) = {
            let mut state = self.state.write();
            let mut new_uuids = Vec::new();
            for node in nodes {
                let (_, new) = state.upsert_node(node.uuid, &node.addr, None, None);
                if new {
                    new_uuids.push(node.uuid);
                }
            }
            let mut changed = false;
            for link in links {
                state.upsert_node(link.a, "", None, None);
                state.upsert_node(link.b, "", None, None);
                changed |= state.set_link(link.a, link.b, link.weight, true);
            }
            (state.snapshot(), new_uuids, changed)
        };
        if changed || !new_uuids.is_empty() {
            self.publish(snapshot);
        }
        new_uuids
    }

    pub fn node(&self, uuid: Uuid) -> Option<NodeRecord> {
        self.state.read().nodes.get(&uuid).cloned()
    }

    pub fn nodes_by_id(&self, local_id: u32) -> Option<NodeRecord> {
        let state = self.state.read();
        let uuid = state.by_id.get(&local_id)?;
        state.nodes.get(uuid).cloned()
    }

    pub fn local_id_of(&self, uuid: Uuid) -> Option<u32> {
        self.state.read().nodes.get(&uuid).map(|n| n.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn tracker() -> Arc<Tracker> {
        Tracker::new(uuid(1), "127.0.0.1:7000".into(), EventBus::new())
    }

    #[test]
    fn local_ids_are_dense_and_stable() {
        let tracker = tracker();
        assert_eq!(tracker.local_id_of(uuid(1)), Some(0));

        tracker.append(uuid(2), "", false);
        tracker.append(uuid(3), "", false);
        tracker.append(uuid(2), "10.0.0.2:7000", false);

        assert_eq!(tracker.local_id_of(uuid(2)), Some(1));
        assert_eq!(tracker.local_id_of(uuid(3)), Some(2));
        assert_eq!(tracker.nodes_by_id(1).unwrap().uuid, uuid(2));
        assert_eq!(tracker.node(uuid(2)).unwrap().addr, "10.0.0.2:7000");
    }

    #[test]
    fn linkstate_is_symmetric() {
        let a = tracker();
        let b = tracker();

        a.linkstate(uuid(5), uuid(6), true);
        b.linkstate(uuid(6), uuid(5), true);

        let ta = a.topology();
        let tb = b.topology();
        assert_eq!(ta.links, tb.links);
        assert!(ta.contains_link(uuid(5), uuid(6)));
    }

    #[test]
    fn linkstate_is_idempotent() {
        let tracker = tracker();
        assert!(tracker.linkstate(uuid(2), uuid(3), true));
        assert!(!tracker.linkstate(uuid(2), uuid(3), true));
        assert!(tracker.linkstate(uuid(2), uuid(3), false));
    }

    #[test]
    fn peer_lifecycle_flips_the_direct_link() {
        let tracker = tracker();
        let (id, new) = tracker.peer_connected(uuid(2), "10.0.0.2:7000", false);
        assert!(new);
        assert_eq!(id, 1);
        assert!(tracker.topology().contains_link(uuid(1), uuid(2)));

        tracker.peer_disconnected(uuid(2));
        assert!(!tracker.topology().contains_link(uuid(1), uuid(2)));
        // The record itself survives disconnection.
        assert!(!tracker.node(uuid(2)).unwrap().connected);
    }

    #[test]
    fn every_snapshot_link_endpoint_is_a_known_node() {
        let tracker = tracker();
        tracker.linkstate(uuid(7), uuid(8), true);
        tracker.peer_connected(uuid(9), "", true);

        let topo = tracker.topology();
        for link in &topo.links {
            assert!(topo.node(link.a).is_some());
            assert!(topo.node(link.b).is_some());
        }
    }

    #[test]
    fn mutating_batches_publish_topology_changed_once() {
        let ebus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        ebus.subscribe(crate::ebus::EventTag::TopologyChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let tracker = Tracker::new(uuid(1), "".into(), ebus);
        tracker.peer_connected(uuid(2), "", false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // No state change, no event.
        tracker.linkstate(uuid(1), uuid(2), true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
