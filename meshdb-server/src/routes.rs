//! Next-hop routing over the cluster graph.
//!
//! For every reachable remote node the synchronizer needs the neighbor to
//! pull through. Paths are shortest-weighted over up links, where a higher
//! link weight means a more preferred (cheaper) edge. Ties break on UUID
//! order so every recomputation yields the same table for the same graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use uuid::Uuid;

use crate::topology::Topology;

/// Edge cost for a link weight. Weight is "bigger is better", Dijkstra
/// wants "smaller is better".
fn cost(weight: u32) -> u64 {
    1_000_000 / u64::from(weight.max(1))
}

/// Compute the next hop toward every node reachable from `local`.
///
/// Returns `destination uuid -> first neighbor on the path`. The local
/// node itself is not in the map.
pub fn next_hops(topology: &Topology, local: Uuid) -> HashMap<Uuid, Uuid> {
    let mut adjacency: HashMap<Uuid, Vec<(Uuid, u64)>> = HashMap::new();
    for link in &topology.links {
        let c = cost(link.weight);
        adjacency.entry(link.a).or_default().push((link.b, c));
        adjacency.entry(link.b).or_default().push((link.a, c));
    }
    for neighbors in adjacency.values_mut() {
        neighbors.sort();
    }

    let mut dist: HashMap<Uuid, u64> = HashMap::new();
    let mut first_hop: HashMap<Uuid, Uuid> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(local, 0);
    heap.push(Reverse((0u64, local)));

    while let Some(Reverse((d, node))) = heap.pop() {
        if d > *dist.get(&node).unwrap_or(&u64::MAX) {
            continue;
        }
        let Some(neighbors) = adjacency.get(&node) else { continue };
        for &(next, c) in neighbors {
            let nd = d + c;
            if nd < *dist.get(&next).unwrap_or(&u64::MAX) {
                dist.insert(next, nd);
                // The first hop toward `next` is `next` itself when we are
                // expanding the local node, otherwise it is inherited from
                // the node we came through.
                let hop = if node == local { next } else { first_hop[&node] };
                first_hop.insert(next, hop);
                heap.push(Reverse((nd, next)));
            }
        }
    }

    first_hop
}
