//! Per-peer connections.
//!
//! A connection is a transport-level link to exactly one remote peer: a
//! TCP control channel carrying handshake, gossip and PMTU verification
//! messages, and a share of the UDP data socket carrying encrypted frame
//! payloads. The lifecycle is
//!
//! ```text
//! Connecting → AwaitingHandshake → Established → Dead
//! ```
//!
//! The two early phases live inside [`handshake`]: a connection object is
//! only constructed once the handshake succeeds, so an `Established`
//! connection is fully formed from birth. `Dead` is terminal and reached
//! through the idempotent [`Connection::shutdown`], from any task, any
//! number of times; the first call wins and the rest are no-ops.

mod forwarder;
mod handshake;
pub mod maker;

pub use forwarder::PmtuDiscovery;
pub use handshake::{accept_connection, read_msg, write_msg, HandshakeParams};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, Decryptor};
use crate::ethernet::fragment_ipv4;
use crate::name::PeerName;
use crate::protocol::{ControlMsg, ProtocolError};
use thiserror::Error;

/// Live connections by remote peer name. Shared between the router's
/// event loop (writer) and the gossip channels (readers).
pub type ConnectionMap =
    Arc<Mutex<std::collections::HashMap<PeerName, Arc<Connection>>>>;

/// Depth of the per-connection forwarding queue. Bounded so one stalled
/// peer sheds its own load instead of blocking the capture path; overflow
/// drops the newest frame with a log line.
pub const FORWARD_QUEUE_DEPTH: usize = 1024;

/// Frame budget assumed before PMTU discovery has verified anything.
pub const DEFAULT_PMTU: u16 = 1438;

/// Errors from connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The frame exceeds the path's validated MTU. A control condition,
    /// not a failure: the caller answers with an ICMP "fragmentation
    /// needed" toward the original sender.
    #[error("frame of {size} bytes exceeds effective PMTU {epmtu}")]
    FrameTooBig { size: usize, epmtu: u16 },

    #[error("connection is not established")]
    NotEstablished,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("remote speaks protocol version {theirs}, we speak {ours}")]
    VersionMismatch { ours: u8, theirs: u8 },

    #[error("connection to ourself")]
    SelfConnection,

    #[error("encryption mismatch: exactly one side has a password configured")]
    CryptoMismatch,

    #[error("authentication failed: key confirmation did not verify")]
    Authentication,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP dial or accept in progress.
    Connecting,
    /// Control channel open, identity exchange under way.
    AwaitingHandshake,
    /// Heartbeats flowing, frames forwardable.
    Established,
    /// Terminal.
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHandshake => "awaiting_handshake",
            ConnectionState::Established => "established",
            ConnectionState::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

/// Events a connection reports to the router's event loop.
pub enum ConnEvent {
    /// Handshake completed; the router must register (or tie-break) it.
    Established(Arc<Connection>),
    /// The connection died. `id` lets the router evict exactly the dead
    /// connection and not a replacement under the same name.
    Dead {
        id: u64,
        remote: PeerName,
        reason: String,
    },
    /// A gossip control message arrived from this connection's remote.
    Gossip { from: PeerName, msg: ControlMsg },
}

/// One frame queued for transmission.
pub(crate) struct ForwardItem {
    pub src: PeerName,
    pub dst: PeerName,
    pub frame: Vec<u8>,
}

/// An established link to one remote peer.
pub struct Connection {
    /// Process-unique identity, distinct from the remote name.
    id: u64,
    local_name: PeerName,
    remote_name: PeerName,
    remote_nickname: String,
    /// TCP-level remote address (the address to redial for outbound).
    remote_addr: SocketAddr,
    /// Where encrypted UDP payloads go. Updated when a heartbeat arrives
    /// from a different observed address (NAT rebinding).
    udp_addr: Mutex<SocketAddr>,
    outbound: bool,
    /// Whether the remote's UDP return address is known. True from the
    /// start for outbound connections (we dialed their advertised port);
    /// inbound connections learn it from the first heartbeat.
    udp_ready: std::sync::atomic::AtomicBool,
    /// Set once the first heartbeat arrives; switches us from fast to
    /// slow heartbeat cadence.
    heartbeat_seen: std::sync::atomic::AtomicBool,
    /// Timing knobs inherited from the router config.
    timing: crate::config::ConnectionConfig,
    state: Mutex<ConnectionState>,
    /// Largest Ethernet frame validated to cross the path unfragmented.
    effective_pmtu: AtomicU64,
    /// Receive-side session state, driven by the router's UDP reader.
    decryptor: Mutex<Box<dyn Decryptor>>,
    last_heartbeat: Mutex<Instant>,
    tcp_tx: mpsc::Sender<ControlMsg>,
    forward_tx: mpsc::Sender<ForwardItem>,
    events: mpsc::UnboundedSender<ConnEvent>,
    shutdown_tx: watch::Sender<bool>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer identity.
    pub fn remote_name(&self) -> PeerName {
        self.remote_name
    }

    pub fn remote_nickname(&self) -> &str {
        &self.remote_nickname
    }

    /// `name(nickname)` of the remote, for logs.
    pub fn remote_full_name(&self) -> String {
        format!("{}({})", self.remote_name, self.remote_nickname)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True when we dialed, false when we accepted.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current validated frame budget (Ethernet header included).
    pub fn effective_pmtu(&self) -> u16 {
        self.effective_pmtu.load(Ordering::Relaxed) as u16
    }

    pub(crate) fn set_effective_pmtu(&self, pmtu: u16) {
        self.effective_pmtu.store(u64::from(pmtu), Ordering::Relaxed);
    }

    /// Where to send UDP payloads for this peer.
    pub fn udp_addr(&self) -> SocketAddr {
        *self.udp_addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether UDP payloads can be sent yet.
    pub fn udp_ready(&self) -> bool {
        self.udp_ready.load(Ordering::Relaxed)
    }

    /// Queue a frame captured locally (or relayed) toward this peer.
    ///
    /// DF frames larger than the validated PMTU come back as
    /// [`ConnectionError::FrameTooBig`]; oversize non-DF IPv4 frames are
    /// fragmented to fit. A full queue drops the frame: UDP level loss
    /// semantics, never backpressure into the capture path.
    pub fn forward(
        &self,
        df: bool,
        frame: &[u8],
        src: PeerName,
        dst: PeerName,
    ) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Established {
            return Err(ConnectionError::NotEstablished);
        }
        let pmtu = self.effective_pmtu();
        if frame.len() > pmtu as usize {
            if df {
                return Err(ConnectionError::FrameTooBig {
                    size: frame.len(),
                    epmtu: pmtu,
                });
            }
            for fragment in fragment_ipv4(frame, pmtu as usize) {
                if fragment.len() > pmtu as usize {
                    // Unfragmentable (non-IP) oversize frame; drop it.
                    debug!(
                        peer = %self.remote_name,
                        size = fragment.len(),
                        "Dropping unfragmentable oversize frame"
                    );
                    continue;
                }
                self.enqueue(src, dst, fragment);
            }
            return Ok(());
        }
        self.enqueue(src, dst, frame.to_vec());
        Ok(())
    }

    /// Queue a frame being relayed from `src` toward `dst` via this link.
    /// Same semantics as [`Connection::forward`]; the names differ so call
    /// sites read like the data flow.
    pub fn relay(
        &self,
        df: bool,
        frame: &[u8],
        src: PeerName,
        dst: PeerName,
    ) -> Result<(), ConnectionError> {
        self.forward(df, frame, src, dst)
    }

    fn enqueue(&self, src: PeerName, dst: PeerName, frame: Vec<u8>) {
        if self
            .forward_tx
            .try_send(ForwardItem { src, dst, frame })
            .is_err()
        {
            warn!(peer = %self.remote_name, "Forward queue full, dropping frame");
        }
    }

    /// Send a control message over the TCP channel. Best effort: a dead
    /// or congested channel drops the message, and the connection's own
    /// liveness machinery notices real failures.
    pub fn send_control(&self, msg: ControlMsg) {
        if self.tcp_tx.try_send(msg).is_err() {
            debug!(peer = %self.remote_name, "Control channel congested, dropping message");
        }
    }

    /// Open one received UDP payload with this connection's session state.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decryptor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .decrypt(payload)
    }

    /// Record a heartbeat observed from `from`. Keeps the connection
    /// alive and retargets UDP sends if the peer's apparent address moved.
    pub fn heartbeat_received(&self, from: SocketAddr) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
        self.heartbeat_seen.store(true, Ordering::Relaxed);
        let was_ready = self.udp_ready.swap(true, Ordering::Relaxed);
        let mut udp_addr = self.udp_addr.lock().unwrap_or_else(|p| p.into_inner());
        if *udp_addr != from {
            if was_ready {
                info!(peer = %self.remote_name, old = %udp_addr, new = %from, "Peer UDP address changed");
            }
            *udp_addr = from;
        }
    }

    pub(crate) fn heartbeat_seen(&self) -> bool {
        self.heartbeat_seen.load(Ordering::Relaxed)
    }

    pub(crate) fn since_last_heartbeat(&self) -> std::time::Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    /// Transition to `Dead` from any state and release resources.
    ///
    /// Idempotent: only the first call notifies tasks, sends the Close
    /// message, and emits the `Dead` event.
    pub fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state == ConnectionState::Dead {
                return;
            }
            *state = ConnectionState::Dead;
        }
        info!(peer = %self.remote_full_name(), reason, "Connection shut down");
        // Best-effort courtesy close; the writer task drains it if alive.
        let _ = self.tcp_tx.try_send(ControlMsg::Close {
            reason: reason.to_string(),
        });
        let _ = self.shutdown_tx.send(true);
        let _ = self.events.send(ConnEvent::Dead {
            id: self.id,
            remote: self.remote_name,
            reason: reason.to_string(),
        });
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} pmtu={}",
            self.remote_full_name(),
            if self.outbound { "out" } else { "in" },
            self.state(),
            self.effective_pmtu(),
        )
    }
}

/// Which of two connections to the same peer survives a simultaneous
/// (crossing) dial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossWinner {
    Existing,
    New,
}

/// Deterministic tie-break for crossing connections.
///
/// Rule: the connection *initiated by the lower-named peer* survives.
/// Both ends evaluate this with swapped `local`/`remote` and reach the
/// same verdict, so exactly one of the pair survives mesh-wide. Two
/// connections in the same direction are not a cross at all — the
/// existing one is kept and the duplicate dropped.
pub fn cross_connection_winner(
    local: PeerName,
    remote: PeerName,
    existing_outbound: bool,
    new_outbound: bool,
) -> CrossWinner {
    if existing_outbound == new_outbound {
        return CrossWinner::Existing;
    }
    let new_initiator = if new_outbound { local } else { remote };
    if new_initiator == local.min(remote) {
        CrossWinner::New
    } else {
        CrossWinner::Existing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_cross_winner_symmetric() {
        let (a, b) = (name(1), name(2));
        // On A: existing outbound dial, incoming connection from B arrives.
        // A < B so A's dial should survive everywhere.
        assert_eq!(cross_connection_winner(a, b, true, false), CrossWinner::Existing);
        // On B: existing outbound dial, incoming from A arrives; A's dial
        // is the new (inbound) connection there and must win.
        assert_eq!(cross_connection_winner(b, a, true, false), CrossWinner::New);
        // Same scenario with arrival order flipped on each side.
        assert_eq!(cross_connection_winner(a, b, false, true), CrossWinner::New);
        assert_eq!(cross_connection_winner(b, a, false, true), CrossWinner::Existing);
    }

    #[test]
    fn test_same_direction_duplicate_keeps_existing() {
        let (a, b) = (name(1), name(2));
        assert_eq!(cross_connection_winner(a, b, true, true), CrossWinner::Existing);
        assert_eq!(cross_connection_winner(a, b, false, false), CrossWinner::Existing);
    }
}
