//! Topic-keyed gossip channels.
//!
//! A [`GossipChannel`] disseminates one subsystem's state across the
//! mesh. Two modes:
//!
//! - periodic: the full state snapshot goes to one randomly chosen
//!   direct connection, so every peer's state eventually reaches
//!   everyone even after partitions heal.
//! - event-driven: a delta is broadcast to every direct connection
//!   (minus the one it arrived on). Receivers re-broadcast only the part
//!   of the delta that actually changed their state, so propagation
//!   terminates once everyone has seen it.
//!
//! The owning subsystem plugs in through the [`Gossiper`] trait. Unknown
//! peer references during a merge are expected mid-convergence and are
//! logged at debug, never treated as fatal.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionMap;
use crate::name::PeerName;
use crate::peer::PeerError;
use crate::protocol::ControlMsg;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("malformed gossip payload: {0}")]
    Malformed(String),
}

impl GossipError {
    /// Whether this is the wait-for-more-info case rather than a defect.
    pub fn is_unknown_peer(&self) -> bool {
        matches!(self, GossipError::Peer(PeerError::UnknownPeer(_)))
    }
}

/// State owner participating in a gossip channel.
pub trait Gossiper: Send + Sync + 'static {
    /// Full state snapshot for periodic exchange and new-peer catch-up.
    fn gossip(&self) -> Vec<u8>;

    /// Apply a full-state payload. The returned bytes are the delta that
    /// changed local state and should be broadcast onward; `None` ends
    /// propagation.
    fn on_gossip(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GossipError>;

    /// Apply a broadcast delta, returning what should propagate further.
    fn on_gossip_broadcast(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GossipError>;

    /// Point-to-point message from `src`. Consumed locally.
    fn on_gossip_unicast(&self, src: PeerName, payload: &[u8]) -> Result<(), GossipError>;
}

/// One gossip topic bound to its state owner and the live connections.
pub struct GossipChannel {
    topic: u32,
    gossiper: Arc<dyn Gossiper>,
    conns: ConnectionMap,
}

impl GossipChannel {
    pub fn new(topic: u32, gossiper: Arc<dyn Gossiper>, conns: ConnectionMap) -> Arc<Self> {
        Arc::new(Self {
            topic,
            gossiper,
            conns,
        })
    }

    /// Spawn the periodic full-state task.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                channel.gossip_now();
            }
        })
    }

    /// Send the full state to one random direct connection.
    pub fn gossip_now(&self) {
        let target = {
            let conns = self.conns.lock().unwrap_or_else(|p| p.into_inner());
            conns.values().choose(&mut rand::thread_rng()).cloned()
        };
        let Some(conn) = target else {
            trace!(topic = self.topic, "No connections to gossip to");
            return;
        };
        trace!(topic = self.topic, peer = %conn.remote_name(), "Periodic gossip");
        conn.send_control(ControlMsg::Gossip {
            topic: self.topic,
            payload: self.gossiper.gossip(),
        });
    }

    /// Send the full state to one specific connection, typically a peer
    /// that just connected and needs catching up.
    pub fn gossip_to(&self, peer: PeerName) {
        let target = {
            let conns = self.conns.lock().unwrap_or_else(|p| p.into_inner());
            conns.get(&peer).cloned()
        };
        if let Some(conn) = target {
            conn.send_control(ControlMsg::Gossip {
                topic: self.topic,
                payload: self.gossiper.gossip(),
            });
        }
    }

    /// Broadcast a delta to every direct connection except `exclude`.
    pub fn broadcast(&self, payload: Vec<u8>, exclude: Option<PeerName>) {
        let targets: Vec<_> = {
            let conns = self.conns.lock().unwrap_or_else(|p| p.into_inner());
            conns
                .values()
                .filter(|c| Some(c.remote_name()) != exclude)
                .cloned()
                .collect()
        };
        for conn in targets {
            conn.send_control(ControlMsg::GossipBroadcast {
                topic: self.topic,
                payload: payload.clone(),
            });
        }
    }

    /// Send a point-to-point payload to a directly connected peer.
    /// Returns false when no direct connection to `dst` exists.
    pub fn unicast(&self, src: PeerName, dst: PeerName, payload: Vec<u8>) -> bool {
        let target = {
            let conns = self.conns.lock().unwrap_or_else(|p| p.into_inner());
            conns.get(&dst).cloned()
        };
        match target {
            Some(conn) => {
                conn.send_control(ControlMsg::GossipUnicast {
                    topic: self.topic,
                    src,
                    payload,
                });
                true
            }
            None => false,
        }
    }

    /// Dispatch a received gossip control message from `from`.
    pub fn handle(&self, from: PeerName, msg: ControlMsg) {
        let outcome = match msg {
            ControlMsg::Gossip { payload, .. } => self.gossiper.on_gossip(&payload),
            ControlMsg::GossipBroadcast { payload, .. } => {
                self.gossiper.on_gossip_broadcast(&payload)
            }
            ControlMsg::GossipUnicast { src, payload, .. } => {
                match self.gossiper.on_gossip_unicast(src, &payload) {
                    Ok(()) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            other => {
                debug!(topic = self.topic, msg = ?other, "Non-gossip message on gossip channel");
                return;
            }
        };
        match outcome {
            Ok(Some(delta)) => self.broadcast(delta, Some(from)),
            Ok(None) => {}
            Err(e) if e.is_unknown_peer() => {
                // Convergence in progress; a fuller update will follow.
                debug!(topic = self.topic, from = %from, error = %e, "Gossip deferred");
            }
            Err(e) => {
                warn!(topic = self.topic, from = %from, error = %e, "Gossip rejected");
            }
        }
    }

    pub fn topic(&self) -> u32 {
        self.topic
    }
}
