//! The peer registry: owner of every peer record.
//!
//! Remote records merge in via [`Peers::apply_update`] under a
//! last-writer-wins-per-peer rule keyed on version numbers, which makes the
//! merge commutative and idempotent: any set of updates applied in any
//! order converges to the same table. Records that drop out of the
//! connection graph are garbage collected, with an eviction callback so
//! dependent state (the MAC cache) is purged with them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;

use tracing::debug;

use super::{Peer, PeerError};
use crate::name::PeerName;

/// A set of peer names.
pub type PeerNameSet = HashSet<PeerName>;

type GcCallback = Box<dyn Fn(&Peer) + Send + Sync>;

struct PeerEntry {
    peer: Peer,
    /// Live local references: established or in-progress connections.
    /// A referenced peer survives GC even while unreachable in the graph.
    local_refs: usize,
}

/// Mapping of peer name → peer record, plus lifecycle management.
pub struct Peers {
    ourself: PeerName,
    inner: Mutex<HashMap<PeerName, PeerEntry>>,
    on_gc: GcCallback,
}

impl Peers {
    /// Create a registry seeded with our own record.
    pub fn new(ourself: Peer, on_gc: GcCallback) -> Self {
        let name = ourself.name;
        let mut table = HashMap::new();
        table.insert(
            name,
            PeerEntry {
                peer: ourself,
                local_refs: 1, // ourself is never collected
            },
        );
        Self {
            ourself: name,
            inner: Mutex::new(table),
            on_gc,
        }
    }

    /// Our own name.
    pub fn ourself_name(&self) -> PeerName {
        self.ourself
    }

    /// Snapshot of one peer record.
    pub fn fetch(&self, name: PeerName) -> Option<Peer> {
        self.lock().get(&name).map(|e| e.peer.clone())
    }

    /// Insert-if-absent; returns the record now in the registry.
    pub fn fetch_with_default(&self, peer: Peer) -> Peer {
        let mut table = self.lock();
        table
            .entry(peer.name)
            .or_insert(PeerEntry {
                peer,
                local_refs: 0,
            })
            .peer
            .clone()
    }

    /// Names of all known peers.
    pub fn names(&self) -> PeerNameSet {
        self.lock().keys().copied().collect()
    }

    /// Snapshot of all records, ourself included.
    pub fn all(&self) -> Vec<Peer> {
        self.lock().values().map(|e| e.peer.clone()).collect()
    }

    /// Pin a peer record against garbage collection (a connection to it
    /// exists or is being set up).
    pub fn add_local_ref(&self, name: PeerName) {
        if let Some(entry) = self.lock().get_mut(&name) {
            entry.local_refs += 1;
        }
    }

    /// Drop a pin. The record stays until the next GC sweep decides.
    pub fn drop_local_ref(&self, name: PeerName) {
        if let Some(entry) = self.lock().get_mut(&name) {
            entry.local_refs = entry.local_refs.saturating_sub(1);
        }
    }

    /// Mutate our own record, bumping its version. Returns the new
    /// snapshot for gossiping.
    pub fn update_ourself(&self, mutate: impl FnOnce(&mut Peer)) -> Peer {
        let mut table = self.lock();
        let entry = table.get_mut(&self.ourself).expect("ourself always present");
        mutate(&mut entry.peer);
        entry.peer.version += 1;
        entry.peer.clone()
    }

    /// Serialize the requested peers' current state for transmission.
    /// Unknown names are skipped; concurrent GC makes that routine.
    pub fn encode_peers(&self, names: &PeerNameSet) -> Vec<u8> {
        let table = self.lock();
        let mut out = Vec::new();
        for name in names {
            if let Some(entry) = table.get(name) {
                entry.peer.encode_into(&mut out);
            }
        }
        out
    }

    /// Decode and merge a gossip payload.
    ///
    /// Returns `(applied, new)`: the names whose records changed, and the
    /// subset previously unknown. Records for peers we already know at an
    /// equal or higher version are ignored — versions from one peer only
    /// move forward. A record claiming to be *us* at a version at or above
    /// our own means somebody holds stale state about our connections; we
    /// reassert by bumping our version past theirs.
    ///
    /// Fails with [`PeerError::UnknownPeer`] when the update's connection
    /// edges mention a peer that is neither in the update nor already
    /// known. Callers treat that as "wait for a fuller update".
    pub fn apply_update(&self, update: &[u8]) -> Result<(PeerNameSet, PeerNameSet), PeerError> {
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < update.len() {
            let (peer, consumed) = Peer::decode(&update[pos..]).map_err(|e| match e {
                PeerError::Truncated(off) => PeerError::Truncated(pos + off),
                other => other,
            })?;
            pos += consumed;
            records.push(peer);
        }

        let decoded_names: PeerNameSet = records.iter().map(|p| p.name).collect();

        let mut applied = PeerNameSet::new();
        let mut new_names = PeerNameSet::new();
        {
            let mut table = self.lock();

            // Edge validation before any mutation, so a bad update is a no-op.
            for record in &records {
                for conn_name in record.connections.keys() {
                    if !decoded_names.contains(conn_name) && !table.contains_key(conn_name) {
                        return Err(PeerError::UnknownPeer(*conn_name));
                    }
                }
            }

            for record in records {
                if record.name == self.ourself {
                    let entry = table.get_mut(&self.ourself).expect("ourself always present");
                    if record.version >= entry.peer.version {
                        // Stale information about us is circulating; outbid it.
                        entry.peer.version = record.version + 1;
                        applied.insert(self.ourself);
                    }
                    continue;
                }
                match table.get_mut(&record.name) {
                    Some(entry) => {
                        if record.version > entry.peer.version {
                            debug!(peer = %record.full_name(), version = record.version, "Updated peer");
                            applied.insert(record.name);
                            entry.peer = record;
                        }
                    }
                    None => {
                        debug!(peer = %record.full_name(), "Discovered peer");
                        applied.insert(record.name);
                        new_names.insert(record.name);
                        table.insert(
                            record.name,
                            PeerEntry {
                                peer: record,
                                local_refs: 0,
                            },
                        );
                    }
                }
            }
        }

        self.garbage_collect();
        Ok((applied, new_names))
    }

    /// Sweep out peers that are unreachable from ourself in the connection
    /// graph and hold no local references. Invokes the eviction callback
    /// per removed peer. Returns the removed records.
    pub fn garbage_collect(&self) -> Vec<Peer> {
        let removed: Vec<Peer> = {
            let mut table = self.lock();
            let reachable = reachable_from(&table, self.ourself);
            let doomed: Vec<PeerName> = table
                .iter()
                .filter(|(name, entry)| {
                    **name != self.ourself && entry.local_refs == 0 && !reachable.contains(*name)
                })
                .map(|(name, _)| *name)
                .collect();
            doomed
                .into_iter()
                .filter_map(|name| table.remove(&name).map(|e| e.peer))
                .collect()
        };
        // Callback outside the lock; it reaches into other subsystems.
        for peer in &removed {
            (self.on_gc)(peer);
        }
        removed
    }

    /// Human-readable peer table for the status report.
    pub fn report(&self) -> String {
        let mut peers = self.all();
        peers.sort_by_key(|p| p.name);
        let mut out = String::new();
        for peer in peers {
            let _ = writeln!(out, "{}", peer);
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerName, PeerEntry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Directed BFS over "is connected to" edges.
fn reachable_from(table: &HashMap<PeerName, PeerEntry>, root: PeerName) -> PeerNameSet {
    let mut seen = PeerNameSet::new();
    seen.insert(root);
    let mut queue = VecDeque::from([root]);
    while let Some(name) = queue.pop_front() {
        let Some(entry) = table.get(&name) else {
            continue;
        };
        for conn_name in entry.peer.connections.keys() {
            if seen.insert(*conn_name) {
                queue.push_back(*conn_name);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    fn make_registry(ours: u8) -> Peers {
        Peers::new(Peer::new(name(ours), format!("peer-{}", ours)), Box::new(|_| {}))
    }

    /// Encode a set of records into a gossip payload.
    fn payload(records: &[Peer]) -> Vec<u8> {
        let mut out = Vec::new();
        for record in records {
            record.encode_into(&mut out);
        }
        out
    }

    fn peer_with(b: u8, version: u64, conns: &[u8]) -> Peer {
        let mut peer = Peer::new(name(b), format!("peer-{}", b));
        peer.version = version;
        for &c in conns {
            peer.add_connection(name(c), 1);
        }
        peer
    }

    #[test]
    fn test_fetch_with_default_interns() {
        let peers = make_registry(1);
        let first = peers.fetch_with_default(peer_with(2, 5, &[]));
        assert_eq!(first.version, 5);
        // Second insert with different content returns the existing record
        let second = peers.fetch_with_default(peer_with(2, 9, &[]));
        assert_eq!(second.version, 5);
    }

    #[test]
    fn test_apply_update_discovers_and_merges() {
        let peers = make_registry(1);
        // Keep the remote graph anchored to us so GC retains it
        peers.update_ourself(|p| p.add_connection(name(2), 1));

        let (applied, new) = peers
            .apply_update(&payload(&[peer_with(2, 1, &[3]), peer_with(3, 1, &[2])]))
            .unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(new.len(), 2);

        // Stale version ignored
        let (applied, _) = peers.apply_update(&payload(&[peer_with(2, 1, &[])])).unwrap();
        assert!(applied.is_empty());
        assert_eq!(peers.fetch(name(2)).unwrap().connections.len(), 1);

        // Newer version replaces
        let (applied, new) = peers.apply_update(&payload(&[peer_with(2, 4, &[])])).unwrap();
        assert!(applied.contains(&name(2)));
        assert!(new.is_empty());
        assert!(peers.fetch(name(2)).unwrap().connections.is_empty());
    }

    #[test]
    fn test_apply_update_order_independent() {
        // The same updates in different orders converge to the same table
        let updates = [
            payload(&[peer_with(2, 3, &[])]),
            payload(&[peer_with(2, 7, &[])]),
            payload(&[peer_with(3, 2, &[])]),
            payload(&[peer_with(2, 5, &[]), peer_with(3, 1, &[])]),
        ];

        let forwards = make_registry(1);
        forwards.update_ourself(|p| {
            p.add_connection(name(2), 1);
            p.add_connection(name(3), 1);
        });
        let backwards = make_registry(1);
        backwards.update_ourself(|p| {
            p.add_connection(name(2), 1);
            p.add_connection(name(3), 1);
        });

        for update in &updates {
            forwards.apply_update(update).unwrap();
        }
        for update in updates.iter().rev() {
            backwards.apply_update(update).unwrap();
        }
        // Idempotence: replay everything again
        for update in &updates {
            forwards.apply_update(update).unwrap();
        }

        assert_eq!(forwards.fetch(name(2)), backwards.fetch(name(2)));
        assert_eq!(forwards.fetch(name(3)), backwards.fetch(name(3)));
        assert_eq!(forwards.fetch(name(2)).unwrap().version, 7);
    }

    #[test]
    fn test_unknown_peer_reference_rejected_then_resolved() {
        let peers = make_registry(1);
        peers.update_ourself(|p| p.add_connection(name(2), 1));

        // Record for 2 references 4, which nobody knows
        let err = peers
            .apply_update(&payload(&[peer_with(2, 1, &[4])]))
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownPeer(n) if n == name(4)));
        // Nothing was applied
        assert!(peers.fetch(name(2)).is_none());

        // A fuller update including 4 applies cleanly
        let (applied, _) = peers
            .apply_update(&payload(&[peer_with(2, 1, &[4]), peer_with(4, 1, &[2])]))
            .unwrap();
        assert!(applied.contains(&name(2)));
        assert!(applied.contains(&name(4)));
    }

    #[test]
    fn test_reassert_over_stale_self_record() {
        let peers = make_registry(1);
        let before = peers.fetch(name(1)).unwrap().version;

        let (applied, new) = peers
            .apply_update(&payload(&[peer_with(1, before + 10, &[])]))
            .unwrap();
        assert!(applied.contains(&name(1)));
        assert!(new.is_empty());
        // Our version outbids the circulating one; our connections are kept
        assert_eq!(peers.fetch(name(1)).unwrap().version, before + 11);
    }

    #[test]
    fn test_gc_removes_unreachable_and_fires_callback() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let peers = Peers::new(
            Peer::new(name(1), "us"),
            Box::new(move |_peer| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        peers.update_ourself(|p| p.add_connection(name(2), 1));
        peers
            .apply_update(&payload(&[peer_with(2, 1, &[3]), peer_with(3, 1, &[])]))
            .unwrap();
        assert!(peers.fetch(name(3)).is_some());

        // 2 drops its edge to 3; 3 becomes unreachable
        peers.apply_update(&payload(&[peer_with(2, 2, &[])])).unwrap();
        assert!(peers.fetch(name(3)).is_none());
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_ref_pins_against_gc() {
        let peers = make_registry(1);
        peers.fetch_with_default(peer_with(9, 1, &[]));
        peers.add_local_ref(name(9));
        assert!(peers.garbage_collect().is_empty());

        peers.drop_local_ref(name(9));
        let removed = peers.garbage_collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, name(9));
    }

    #[test]
    fn test_encode_peers_skips_unknown() {
        let peers = make_registry(1);
        let mut names = PeerNameSet::new();
        names.insert(name(1));
        names.insert(name(42)); // unknown
        let encoded = peers.encode_peers(&names);
        let (decoded, consumed) = Peer::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.name, name(1));
    }
}
