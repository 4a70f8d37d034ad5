//! Immutable topology snapshots and their difference.
//!
//! A topology is a value: the set of known nodes and the set of up links
//! between them at one instant. The tracker publishes a fresh snapshot
//! behind an `Arc` after every mutating batch; readers hold the `Arc` for
//! as long as they need a consistent view.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::proto::{self, TopoLinkDoc, TopoNodeDoc, TopologyDoc};

/// A node as seen by a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopoNode {
    pub uuid: Uuid,
    pub addr: String,
}

/// An up link between two nodes. Endpoints are stored in ascending UUID
/// order so that links compare and sort consistently everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TopoLink {
    pub a: Uuid,
    pub b: Uuid,
    pub weight: u32,
}

impl TopoLink {
    /// Build a link with canonical endpoint order.
    pub fn new(x: Uuid, y: Uuid, weight: u32) -> Self {
        if x <= y {
            Self { a: x, b: y, weight }
        } else {
            Self { a: y, b: x, weight }
        }
    }

    fn key(&self) -> (Uuid, Uuid) {
        (self.a, self.b)
    }
}

/// Immutable snapshot of the cluster graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Known nodes, sorted by UUID.
    pub nodes: Vec<TopoNode>,
    /// Up links, sorted by (min-uuid, max-uuid).
    pub links: Vec<TopoLink>,
}

impl Topology {
    pub fn new(mut nodes: Vec<TopoNode>, mut links: Vec<TopoLink>) -> Arc<Self> {
        nodes.sort_by_key(|n| n.uuid);
        links.sort_by_key(|l| l.key());
        Arc::new(Self { nodes, links })
    }

    pub fn node(&self, uuid: Uuid) -> Option<&TopoNode> {
        self.nodes
            .binary_search_by_key(&uuid, |n| n.uuid)
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn contains_link(&self, a: Uuid, b: Uuid) -> bool {
        let key = TopoLink::new(a, b, 0).key();
        self.links.binary_search_by_key(&key, |l| l.key()).is_ok()
    }

    /// Difference of two snapshots: links present only in `self` and links
    /// present only in `other`. Both inputs are sorted, so a single merge
    /// pass over the two sequences suffices.
    pub fn diff(&self, other: &Topology) -> (Vec<TopoLink>, Vec<TopoLink>) {
        let mut only_a = Vec::new();
        let mut only_b = Vec::new();

        let mut ia = 0;
        let mut ib = 0;
        while ia < self.links.len() && ib < other.links.len() {
            let la = &self.links[ia];
            let lb = &other.links[ib];
            match la.key().cmp(&lb.key()) {
                std::cmp::Ordering::Less => {
                    only_a.push(*la);
                    ia += 1;
                }
                std::cmp::Ordering::Greater => {
                    only_b.push(*lb);
                    ib += 1;
                }
                std::cmp::Ordering::Equal => {
                    ia += 1;
                    ib += 1;
                }
            }
        }
        only_a.extend_from_slice(&self.links[ia..]);
        only_b.extend_from_slice(&other.links[ib..]);

        (only_a, only_b)
    }

    /// Restrict a snapshot to the given links and their endpoint nodes.
    /// Used to answer a toposync with only the links the requester lacks.
    pub fn restrict(&self, links: &[TopoLink]) -> Arc<Topology> {
        let mut nodes = Vec::new();
        for link in links {
            for uuid in [link.a, link.b] {
                if let Some(node) = self.node(uuid) {
                    if !nodes.iter().any(|n: &TopoNode| n.uuid == uuid) {
                        nodes.push(node.clone());
                    }
                }
            }
        }
        Topology::new(nodes, links.to_vec())
    }

    /// Serialize into the wire document. Links are encoded as indices into
    /// the node list.
    pub fn to_doc(&self) -> TopologyDoc {
        let index: HashMap<Uuid, u32> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.uuid, i as u32))
            .collect();

        let nodes: Vec<TopoNodeDoc> = self
            .nodes
            .iter()
            .map(|n| {
                let (uuid_hi, uuid_lo) = proto::uuid_halves(n.uuid);
                TopoNodeDoc { uuid_hi, uuid_lo, addr: n.addr.clone() }
            })
            .collect();

        // Links whose endpoints are unknown nodes are not representable on
        // the wire; the tracker never produces such a snapshot.
        let links: Vec<TopoLinkDoc> = self
            .links
            .iter()
            .filter_map(|l| {
                Some(TopoLinkDoc {
                    a: *index.get(&l.a)?,
                    b: *index.get(&l.b)?,
                    weight: l.weight,
                })
            })
            .collect();

        let extradata_size = self.nodes.iter().map(|n| n.addr.len() as u64 + 1).sum();

        TopologyDoc {
            node_count: nodes.len() as u64,
            link_count: links.len() as u64,
            extradata_size,
            nodes,
            links,
        }
    }

    /// Deserialize a wire document, validating link indices.
    pub fn from_doc(doc: &TopologyDoc) -> Result<Arc<Topology>> {
        let nodes: Vec<TopoNode> = doc
            .nodes
            .iter()
            .map(|n| TopoNode {
                uuid: proto::uuid_from_halves(n.uuid_hi, n.uuid_lo),
                addr: n.addr.clone(),
            })
            .collect();

        let mut links = Vec::with_capacity(doc.links.len());
        for link in &doc.links {
            let a = nodes
                .get(link.a as usize)
                .ok_or_else(|| Error::invalid_message("link endpoint index out of range"))?;
            let b = nodes
                .get(link.b as usize)
                .ok_or_else(|| Error::invalid_message("link endpoint index out of range"))?;
            links.push(TopoLink::new(a.uuid, b.uuid, link.weight));
        }

        Ok(Topology::new(nodes, links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn node(n: u128) -> TopoNode {
        TopoNode { uuid: uuid(n), addr: format!("10.0.0.{n}:7000") }
    }

    #[test]
    fn link_endpoints_are_canonically_ordered() {
        let l1 = TopoLink::new(uuid(2), uuid(1), 1);
        let l2 = TopoLink::new(uuid(1), uuid(2), 1);
        assert_eq!(l1, l2);
        assert!(l1.a < l1.b);
    }

    #[test]
    fn diff_is_a_sorted_merge() {
        let a = Topology::new(
            vec![node(1), node(2), node(3)],
            vec![TopoLink::new(uuid(1), uuid(2), 1), TopoLink::new(uuid(2), uuid(3), 1)],
        );
        let b = Topology::new(
            vec![node(1), node(2), node(4)],
            vec![TopoLink::new(uuid(1), uuid(2), 1), TopoLink::new(uuid(1), uuid(4), 1)],
        );

        let (only_a, only_b) = a.diff(&b);
        assert_eq!(only_a, vec![TopoLink::new(uuid(2), uuid(3), 1)]);
        assert_eq!(only_b, vec![TopoLink::new(uuid(1), uuid(4), 1)]);

        let (still_a, still_b) = a.diff(&a);
        assert!(still_a.is_empty());
        assert!(still_b.is_empty());
    }

    #[test]
    fn doc_roundtrip_preserves_nodes_links_and_weights() {
        let topo = Topology::new(
            vec![node(3), node(1), node(2)],
            vec![TopoLink::new(uuid(2), uuid(1), 7), TopoLink::new(uuid(3), uuid(2), 1)],
        );

        let doc = topo.to_doc();
        assert_eq!(doc.node_count, 3);
        assert_eq!(doc.link_count, 2);

        let back = Topology::from_doc(&doc).unwrap();
        assert_eq!(back.nodes, topo.nodes);
        assert_eq!(back.links, topo.links);
    }

    #[test]
    fn every_link_endpoint_is_a_known_node_after_decode() {
        let topo = Topology::new(
            vec![node(1), node(2)],
            vec![TopoLink::new(uuid(1), uuid(2), 1)],
        );
        let mut doc = topo.to_doc();
        doc.links[0].b = 9; // out of range
        assert!(Topology::from_doc(&doc).is_err());
    }

    #[test]
    fn restrict_keeps_only_link_endpoints() {
        let topo = Topology::new(
            vec![node(1), node(2), node(3)],
            vec![TopoLink::new(uuid(1), uuid(2), 1), TopoLink::new(uuid(2), uuid(3), 1)],
        );
        let sub = topo.restrict(&[TopoLink::new(uuid(1), uuid(2), 1)]);
        assert_eq!(sub.nodes.len(), 2);
        assert_eq!(sub.links.len(), 1);
        assert!(sub.node(uuid(3)).is_none());
    }
}
