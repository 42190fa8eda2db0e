//! Peer records and the peer registry.
//!
//! A `Peer` is one router instance's view of a mesh participant: identity,
//! nickname, a monotonically increasing version number, and the set of
//! peers it is connected to. The local instance's own record is mutable
//! and owned here; every remote record is an immutable snapshot replicated
//! by gossip and replaced wholesale when a higher version arrives.
//!
//! The registry ([`Peers`]) is the single owner of all records. Everything
//! else refers to peers by name, so garbage collection never invalidates a
//! live reference.

mod registry;

pub use registry::{PeerNameSet, Peers};

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::name::{PeerName, NAME_SIZE};

/// Errors from peer record handling.
#[derive(Debug, Error)]
pub enum PeerError {
    /// A gossip update referenced a peer neither included in the update
    /// nor already known. Non-fatal: a later, fuller update resolves it.
    #[error("reference to unknown peer {0}")]
    UnknownPeer(PeerName),

    #[error("truncated peer update at offset {0}")]
    Truncated(usize),

    #[error("invalid peer update: {0}")]
    Malformed(String),
}

/// One edge in a peer's connection set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerSummary {
    /// Name of the connected peer.
    pub name: PeerName,
    /// Advertised link metric. Carried in gossip and shown in diagnostics;
    /// route selection is hop-count based.
    pub metric: u16,
}

/// A mesh participant as currently known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub name: PeerName,
    pub nickname: String,
    /// Bumped by the owning instance whenever its connection set changes.
    /// Merge rule everywhere: higher version wins, ties keep the existing.
    pub version: u64,
    /// Connected-peer-name → edge. Ordered map so encoding is canonical.
    pub connections: BTreeMap<PeerName, PeerSummary>,
}

impl Peer {
    /// Create a fresh record with no connections.
    pub fn new(name: PeerName, nickname: impl Into<String>) -> Self {
        Self {
            name,
            nickname: nickname.into(),
            version: 0,
            connections: BTreeMap::new(),
        }
    }

    /// `name(nickname)` — the form used in logs and status output.
    pub fn full_name(&self) -> String {
        format!("{}({})", self.name, self.nickname)
    }

    /// Record a connection to `to`. Self-loops are ignored; a peer is
    /// never connected to itself.
    pub fn add_connection(&mut self, to: PeerName, metric: u16) {
        if to == self.name {
            return;
        }
        self.connections.insert(to, PeerSummary { name: to, metric });
    }

    /// Remove the connection to `to`, if recorded.
    pub fn remove_connection(&mut self, to: PeerName) {
        self.connections.remove(&to);
    }

    /// Append this record to a gossip payload.
    ///
    /// ```text
    /// [name:8][nick_len:2 BE][nickname][version:8 BE]
    /// [conn_count:2 BE] n × { [name:8][metric:2 BE] }
    /// ```
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.name.as_slice());
        out.extend_from_slice(&(self.nickname.len() as u16).to_be_bytes());
        out.extend_from_slice(self.nickname.as_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.connections.len() as u16).to_be_bytes());
        for summary in self.connections.values() {
            out.extend_from_slice(summary.name.as_slice());
            out.extend_from_slice(&summary.metric.to_be_bytes());
        }
    }

    /// Decode one record, returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), PeerError> {
        let mut pos = 0;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], PeerError> {
            if buf.len() < *pos + n {
                return Err(PeerError::Truncated(*pos));
            }
            let slice = &buf[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };

        let name = PeerName::from_slice(take(&mut pos, NAME_SIZE)?)
            .expect("slice length fixed above");
        let nick_len =
            u16::from_be_bytes(take(&mut pos, 2)?.try_into().expect("len prefix")) as usize;
        let nickname = String::from_utf8(take(&mut pos, nick_len)?.to_vec())
            .map_err(|_| PeerError::Malformed("nickname not utf-8".to_string()))?;
        let version = u64::from_be_bytes(take(&mut pos, 8)?.try_into().expect("version size"));
        let conn_count =
            u16::from_be_bytes(take(&mut pos, 2)?.try_into().expect("len prefix")) as usize;

        let mut connections = BTreeMap::new();
        for _ in 0..conn_count {
            let conn_name = PeerName::from_slice(take(&mut pos, NAME_SIZE)?)
                .expect("slice length fixed above");
            let metric = u16::from_be_bytes(take(&mut pos, 2)?.try_into().expect("metric size"));
            if conn_name == name {
                // Self-loops never appear in well-formed records; drop quietly.
                continue;
            }
            connections.insert(
                conn_name,
                PeerSummary {
                    name: conn_name,
                    metric,
                },
            );
        }

        Ok((
            Self {
                name,
                nickname,
                version,
                connections,
            },
            pos,
        ))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.full_name(), self.version)?;
        if !self.connections.is_empty() {
            let names: Vec<String> = self
                .connections
                .keys()
                .map(|name| name.to_string())
                .collect();
            write!(f, " -> [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut peer = Peer::new(name(1), "alpha");
        peer.version = 9;
        peer.add_connection(name(2), 1);
        peer.add_connection(name(3), 5);

        let mut buf = Vec::new();
        peer.encode_into(&mut buf);
        let (decoded, consumed) = Peer::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, peer);
    }

    #[test]
    fn test_self_loop_never_recorded() {
        let mut peer = Peer::new(name(1), "alpha");
        peer.add_connection(name(1), 1);
        assert!(peer.connections.is_empty());
    }

    #[test]
    fn test_decode_drops_self_loop() {
        let mut peer = Peer::new(name(1), "alpha");
        peer.add_connection(name(2), 1);
        let mut buf = Vec::new();
        peer.encode_into(&mut buf);
        // Forge an extra connection entry pointing back at the peer itself
        let count_off = NAME_SIZE + 2 + 5 + 8;
        buf[count_off..count_off + 2].copy_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(name(1).as_slice());
        buf.extend_from_slice(&1u16.to_be_bytes());

        let (decoded, _) = Peer::decode(&buf).unwrap();
        assert!(!decoded.connections.contains_key(&name(1)));
        assert!(decoded.connections.contains_key(&name(2)));
    }

    #[test]
    fn test_decode_truncated() {
        let mut peer = Peer::new(name(1), "alpha");
        peer.add_connection(name(2), 1);
        let mut buf = Vec::new();
        peer.encode_into(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(matches!(Peer::decode(&buf), Err(PeerError::Truncated(_))));
    }
}
