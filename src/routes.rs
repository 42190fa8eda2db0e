//! Unicast route table.
//!
//! For every reachable peer, the table answers one question: which direct
//! neighbor is the next hop. Routes are recomputed from a registry
//! snapshot on every topology change and installed with a single table
//! swap, so the forwarding path reads either the old table or the new one,
//! never a half-built one.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::name::PeerName;
use crate::peer::Peers;

/// Next-hop table over the peer connection graph.
pub struct Routes {
    peers: Arc<Peers>,
    unicast: RwLock<HashMap<PeerName, PeerName>>,
}

impl Routes {
    pub fn new(peers: Arc<Peers>) -> Self {
        Self {
            peers,
            unicast: RwLock::new(HashMap::new()),
        }
    }

    /// Next hop toward `dest`, or None when unreachable.
    pub fn unicast(&self, dest: PeerName) -> Option<PeerName> {
        self.read().get(&dest).copied()
    }

    /// Number of routed destinations.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Rebuild the table from the current registry contents.
    ///
    /// Shortest path by hop count over the directed "is connected to"
    /// edges, rooted at ourself. Among equal-length paths the lowest
    /// first-hop name wins, so every replica computing the same graph
    /// installs the same routes.
    pub fn recalculate(&self) {
        let ourself = self.peers.ourself_name();
        let graph: HashMap<PeerName, Vec<PeerName>> = self
            .peers
            .all()
            .into_iter()
            .map(|peer| {
                let mut conns: Vec<PeerName> = peer.connections.keys().copied().collect();
                conns.sort();
                (peer.name, conns)
            })
            .collect();

        // Pass 1: hop counts by BFS.
        let mut dist: HashMap<PeerName, usize> = HashMap::from([(ourself, 0)]);
        let mut queue = VecDeque::from([ourself]);
        while let Some(u) = queue.pop_front() {
            let du = dist[&u];
            for &v in graph.get(&u).into_iter().flatten() {
                if !dist.contains_key(&v) && graph.contains_key(&v) {
                    dist.insert(v, du + 1);
                    queue.push_back(v);
                }
            }
        }

        // Pass 2: first hops, level by level, taking the minimum over all
        // shortest-path predecessors so ties break deterministically.
        let mut first_hop: HashMap<PeerName, PeerName> = HashMap::new();
        let max_dist = dist.values().copied().max().unwrap_or(0);
        for level in 1..=max_dist {
            for (&u, conns) in &graph {
                if dist.get(&u) != Some(&(level - 1)) {
                    continue;
                }
                for &v in conns {
                    if dist.get(&v) != Some(&level) {
                        continue;
                    }
                    let via = if level == 1 {
                        v
                    } else {
                        // Predecessors at level-1 were all assigned last round
                        match first_hop.get(&u) {
                            Some(&hop) => hop,
                            None => continue,
                        }
                    };
                    match first_hop.get(&v) {
                        Some(&current) if current <= via => {}
                        _ => {
                            first_hop.insert(v, via);
                        }
                    }
                }
            }
        }

        debug!(routes = first_hop.len(), "Recalculated routes");
        *self.write() = first_hop;
    }

    /// Human-readable route table for the status report.
    pub fn report(&self) -> String {
        let table = self.read();
        let mut entries: Vec<(&PeerName, &PeerName)> = table.iter().collect();
        entries.sort();
        let mut out = String::new();
        for (dest, hop) in entries {
            let _ = writeln!(out, "{} -> {}", dest, hop);
        }
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PeerName, PeerName>> {
        self.unicast.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerName, PeerName>> {
        self.unicast.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;

    fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    /// Build a registry + routes over a symmetric edge list rooted at 1.
    fn make_routes(edges: &[(u8, u8)]) -> Routes {
        let peers = Arc::new(Peers::new(Peer::new(name(1), "us"), Box::new(|_| {})));
        let mut adjacency: HashMap<u8, Vec<u8>> = HashMap::new();
        for &(a, b) in edges {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }
        peers.update_ourself(|p| {
            for &n in adjacency.get(&1).into_iter().flatten() {
                p.add_connection(name(n), 1);
            }
        });
        let mut payload = Vec::new();
        for (&node, conns) in &adjacency {
            if node == 1 {
                continue;
            }
            let mut peer = Peer::new(name(node), format!("peer-{}", node));
            peer.version = 1;
            for &c in conns {
                peer.add_connection(name(c), 1);
            }
            peer.encode_into(&mut payload);
        }
        peers.apply_update(&payload).unwrap();
        let routes = Routes::new(peers);
        routes.recalculate();
        routes
    }

    #[test]
    fn test_three_peer_line() {
        // 1 - 2 - 3: route to 3 goes via 2
        let routes = make_routes(&[(1, 2), (2, 3)]);
        assert_eq!(routes.unicast(name(2)), Some(name(2)));
        assert_eq!(routes.unicast(name(3)), Some(name(2)));
    }

    #[test]
    fn test_unreachable_peer_has_no_route() {
        let routes = make_routes(&[(1, 2), (3, 4)]);
        assert_eq!(routes.unicast(name(2)), Some(name(2)));
        // 3 and 4 were GCed as unreachable, so no routes either way
        assert_eq!(routes.unicast(name(3)), None);
        assert_eq!(routes.unicast(name(4)), None);
        assert_eq!(routes.unicast(name(9)), None);
    }

    #[test]
    fn test_equal_path_tie_breaks_to_lowest_first_hop() {
        // 1-2-4 and 1-3-4: both two hops, 2 < 3 so 4 routes via 2
        let routes = make_routes(&[(1, 2), (1, 3), (2, 4), (3, 4)]);
        assert_eq!(routes.unicast(name(4)), Some(name(2)));
        // And deeper nodes inherit the winning first hop
        let routes = make_routes(&[(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)]);
        assert_eq!(routes.unicast(name(5)), Some(name(2)));
    }

    #[test]
    fn test_shorter_path_beats_lower_name() {
        // 4 is a direct neighbor via nothing: 1-4 direct plus 1-2-4
        let routes = make_routes(&[(1, 4), (1, 2), (2, 4)]);
        assert_eq!(routes.unicast(name(4)), Some(name(4)));
    }

    #[test]
    fn test_next_hop_is_always_direct_neighbor() {
        // Loop-freedom: every route's next hop is a direct neighbor of
        // ourself, so following next hops terminates in one step.
        let routes = make_routes(&[(1, 2), (1, 3), (2, 4), (3, 5), (4, 6), (5, 6), (6, 7)]);
        let neighbors = [name(2), name(3)];
        for node in 2u8..=7 {
            let hop = routes.unicast(name(node)).unwrap();
            assert!(neighbors.contains(&hop), "route to {} via {}", node, hop);
        }
    }

    #[test]
    fn test_recalculate_replaces_table() {
        let routes = make_routes(&[(1, 2), (2, 3)]);
        assert_eq!(routes.unicast(name(3)), Some(name(2)));
        // Topology change: 2 loses its edge to 3
        let mut peer2 = Peer::new(name(2), "peer-2");
        peer2.version = 2;
        peer2.add_connection(name(1), 1);
        let mut payload = Vec::new();
        peer2.encode_into(&mut payload);
        routes.peers.apply_update(&payload).unwrap();
        routes.recalculate();
        assert_eq!(routes.unicast(name(3)), None);
        assert_eq!(routes.unicast(name(2)), Some(name(2)));
    }
}
