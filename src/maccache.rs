//! MAC learning cache.
//!
//! Maps hardware addresses to the peer that owns them, learned from frame
//! source addresses on both the capture side and the overlay side. Each
//! address maps to at most one peer; the newest observation wins. Entries
//! expire after `max_age` (configured well above typical ARP cache
//! lifetimes so the overlay never forgets a MAC before local hosts do) and
//! a periodic sweep evicts the stale ones.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::ethernet::MacAddr;
use crate::name::PeerName;

type ExpiryCallback = Box<dyn Fn(MacAddr, PeerName) + Send + Sync>;

struct Entry {
    peer: PeerName,
    last_seen: Instant,
}

/// Hardware address → owning peer, with time-based expiry.
pub struct MacCache {
    max_age: Duration,
    inner: Mutex<HashMap<MacAddr, Entry>>,
    on_expiry: ExpiryCallback,
}

impl MacCache {
    pub fn new(max_age: Duration, on_expiry: ExpiryCallback) -> Self {
        Self {
            max_age,
            inner: Mutex::new(HashMap::new()),
            on_expiry,
        }
    }

    /// Record or refresh ownership of `mac` by `peer`.
    ///
    /// Returns true only on first-learn or owner change, so callers can
    /// log discoveries without logging every refresh.
    pub fn enter(&self, mac: MacAddr, peer: PeerName) -> bool {
        let mut table = self.lock();
        match table.get_mut(&mac) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                if entry.peer == peer {
                    false
                } else {
                    entry.peer = peer;
                    true
                }
            }
            None => {
                table.insert(
                    mac,
                    Entry {
                        peer,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Current owner of `mac`, if known and unexpired.
    pub fn lookup(&self, mac: MacAddr) -> Option<PeerName> {
        let table = self.lock();
        let entry = table.get(&mac)?;
        if entry.last_seen.elapsed() > self.max_age {
            // Stale but unswept; treat as unknown
            return None;
        }
        Some(entry.peer)
    }

    /// Purge every entry owned by `peer`. Called when the registry
    /// garbage-collects a peer.
    pub fn delete(&self, peer: PeerName) {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, entry| entry.peer != peer);
        let removed = before - table.len();
        if removed > 0 {
            debug!(peer = %peer, entries = removed, "Purged MAC entries for removed peer");
        }
    }

    /// Evict entries older than `max_age`, invoking the expiry callback
    /// for each.
    pub fn sweep(&self) {
        let expired: Vec<(MacAddr, PeerName)> = {
            let mut table = self.lock();
            let max_age = self.max_age;
            let mut gone = Vec::new();
            table.retain(|mac, entry| {
                if entry.last_seen.elapsed() > max_age {
                    gone.push((*mac, entry.peer));
                    false
                } else {
                    true
                }
            });
            gone
        };
        for (mac, peer) in expired {
            (self.on_expiry)(mac, peer);
        }
    }

    /// Spawn the periodic sweep task.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Human-readable MAC table for the status report.
    pub fn report(&self) -> String {
        let table = self.lock();
        let mut entries: Vec<(String, PeerName)> = table
            .iter()
            .map(|(mac, entry)| (mac.to_string(), entry.peer))
            .collect();
        entries.sort();
        let mut out = String::new();
        for (mac, peer) in entries {
            let _ = writeln!(out, "{} -> {}", mac, peer);
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MacAddr, Entry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mac(b: u8) -> MacAddr {
        MacAddr::from_bytes([2, 0, 0, 0, 0, b])
    }

    fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    fn make_cache(max_age: Duration) -> MacCache {
        MacCache::new(max_age, Box::new(|_, _| {}))
    }

    #[test]
    fn test_enter_reports_learn_and_owner_change_only() {
        let cache = make_cache(Duration::from_secs(60));
        assert!(cache.enter(mac(1), name(1))); // first learn
        assert!(!cache.enter(mac(1), name(1))); // refresh
        assert!(cache.enter(mac(1), name(2))); // owner change
        assert_eq!(cache.lookup(mac(1)), Some(name(2)));
    }

    #[test]
    fn test_lookup_unknown() {
        let cache = make_cache(Duration::from_secs(60));
        assert_eq!(cache.lookup(mac(9)), None);
    }

    #[test]
    fn test_delete_purges_one_peers_entries() {
        let cache = make_cache(Duration::from_secs(60));
        cache.enter(mac(1), name(1));
        cache.enter(mac(2), name(1));
        cache.enter(mac(3), name(2));
        cache.delete(name(1));
        assert_eq!(cache.lookup(mac(1)), None);
        assert_eq!(cache.lookup(mac(2)), None);
        assert_eq!(cache.lookup(mac(3)), Some(name(2)));
    }

    #[test]
    fn test_sweep_expires_and_fires_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let cache = MacCache::new(
            Duration::from_millis(5),
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.enter(mac(1), name(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.lookup(mac(1)), None); // stale before sweep
        cache.sweep();
        assert_eq!(cache.len(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_postpones_expiry() {
        let cache = make_cache(Duration::from_millis(50));
        cache.enter(mac(1), name(1));
        std::thread::sleep(Duration::from_millis(30));
        cache.enter(mac(1), name(1)); // refresh
        std::thread::sleep(Duration::from_millis(30));
        cache.sweep();
        assert_eq!(cache.lookup(mac(1)), Some(name(1)));
    }
}
