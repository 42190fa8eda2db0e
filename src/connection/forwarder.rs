//! Per-connection UDP send path.
//!
//! The forwarder task owns the connection's encryptor and is the only
//! writer of its UDP payloads, so the nonce counter needs no locking. It
//! drains the forwarding queue into batched datagrams, drives the
//! heartbeat cadence (fast until the remote is first heard, then the
//! configured interval), enforces the heartbeat timeout, and runs PMTU
//! discovery: probe at the path-permitted maximum, then binary-search
//! between the highest verified and lowest failed sizes. Verification
//! answers arrive over the TCP control channel via `pmtu_rx`.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{Connection, ForwardItem, DEFAULT_PMTU};
use crate::crypto::Encryptor;
use crate::ethernet::ETHERNET_OVERHEAD;
use crate::name::NAME_SIZE;
use crate::protocol::{
    encode_frame_unit, make_frag_test, make_heartbeat, make_pmtu_probe, ControlMsg,
    FRAME_UNIT_OVERHEAD,
};

/// Heartbeat cadence before the remote has been heard even once.
const FAST_HEARTBEAT: Duration = Duration::from_millis(500);

/// How often an outstanding PMTU probe is (re)sent.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Probe sends per candidate size before the size is declared failed.
const PROBE_SENDS_PER_CANDIDATE: u8 = 8;

/// IPv4 + UDP header bytes, subtracted from the 64 KiB datagram ceiling.
const IP_UDP_OVERHEAD: usize = 20 + 8;

// ============================================================================
// PMTU search
// ============================================================================

/// Binary search over probe sizes for the largest one the path delivers.
///
/// `verified` only ever rises and `ceiling` only ever falls, so the
/// search interval shrinks at every resolved candidate and the search
/// terminates. Sizes here exclude the Ethernet header; the connection's
/// effective PMTU is `ETHERNET_OVERHEAD` larger.
#[derive(Debug)]
pub struct PmtuDiscovery {
    verified: u16,
    ceiling: u16,
    candidate: u16,
    sends_left: u8,
    settled: bool,
}

impl PmtuDiscovery {
    /// Start a search with `floor` assumed good and `ceiling` the largest
    /// size the wire format permits.
    pub fn new(floor: u16, ceiling: u16) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            verified: floor,
            ceiling,
            candidate: ceiling,
            sends_left: PROBE_SENDS_PER_CANDIDATE,
            settled: floor == ceiling,
        }
    }

    /// Next probe size to send, or `None` once the search has settled.
    ///
    /// Sending the same candidate more than `PROBE_SENDS_PER_CANDIDATE`
    /// times without an answer counts as a failure and moves the search
    /// down.
    pub fn next_probe(&mut self) -> Option<u16> {
        if self.settled {
            return None;
        }
        if self.sends_left == 0 {
            self.reject();
            if self.settled {
                return None;
            }
        }
        self.sends_left -= 1;
        Some(self.candidate)
    }

    /// Record a verification answer. Returns true when the largest
    /// verified size grew.
    pub fn verified(&mut self, size: u16) -> bool {
        if self.settled || size != self.candidate {
            return false;
        }
        self.verified = self.candidate;
        if self.verified >= self.ceiling {
            self.settled = true;
        } else {
            self.candidate = midpoint(self.verified, self.ceiling);
            self.sends_left = PROBE_SENDS_PER_CANDIDATE;
        }
        true
    }

    fn reject(&mut self) {
        self.ceiling = self.candidate - 1;
        if self.ceiling <= self.verified {
            self.settled = true;
        } else {
            self.candidate = midpoint(self.verified, self.ceiling);
            self.sends_left = PROBE_SENDS_PER_CANDIDATE;
        }
    }

    /// Largest size verified so far.
    pub fn effective(&self) -> u16 {
        self.verified
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }
}

/// Upper midpoint of `(lo, hi]`; always greater than `lo`.
fn midpoint(lo: u16, hi: u16) -> u16 {
    lo + (hi - lo + 1) / 2
}

// ============================================================================
// Forwarder task
// ============================================================================

pub(crate) async fn run(
    conn: Arc<Connection>,
    udp: Arc<UdpSocket>,
    mut encryptor: Box<dyn Encryptor>,
    mut forward_rx: mpsc::Receiver<ForwardItem>,
    mut pmtu_rx: mpsc::Receiver<ControlMsg>,
) {
    let mut shutdown = conn.shutdown_rx();

    // Largest frame body a single datagram can carry after all framing.
    let wire_overhead =
        IP_UDP_OVERHEAD + NAME_SIZE + encryptor.overhead() + FRAME_UNIT_OVERHEAD;
    let max_payload = u16::MAX as usize - IP_UDP_OVERHEAD - NAME_SIZE - encryptor.overhead();
    let probe_ceiling = (u16::MAX as usize - wire_overhead - ETHERNET_OVERHEAD) as u16;
    let mut discovery =
        PmtuDiscovery::new(DEFAULT_PMTU - ETHERNET_OVERHEAD as u16, probe_ceiling);
    let mut frag_works = false;
    let mut frag_test_pending = true;

    let mut heartbeat_counter: u64 = 0;
    let mut heartbeat_tick = tokio::time::interval(FAST_HEARTBEAT);
    heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut slow_cadence = false;

    let mut probe_tick = tokio::time::interval(PROBE_INTERVAL);
    probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            Some(item) = forward_rx.recv() => {
                send_batched(&conn, &udp, encryptor.as_mut(), &mut forward_rx, item, max_payload)
                    .await;
            }

            _ = heartbeat_tick.tick() => {
                if conn.since_last_heartbeat() > conn.timing.heartbeat_timeout() {
                    conn.shutdown("heartbeat timeout");
                    break;
                }
                send_frame(&conn, &udp, encryptor.as_mut(), &make_heartbeat(heartbeat_counter))
                    .await;
                heartbeat_counter += 1;
                if !slow_cadence && conn.heartbeat_seen() {
                    slow_cadence = true;
                    heartbeat_tick = tokio::time::interval(conn.timing.heartbeat());
                    heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    heartbeat_tick.reset();
                }
            }

            _ = probe_tick.tick() => {
                if frag_test_pending {
                    send_frame(&conn, &udp, encryptor.as_mut(), &make_frag_test()).await;
                }
                if let Some(size) = discovery.next_probe() {
                    trace!(peer = %conn.remote_name(), size, "Sending PMTU probe");
                    send_frame(&conn, &udp, encryptor.as_mut(), &make_pmtu_probe(size)).await;
                } else if discovery.is_settled() && frag_test_pending {
                    // Search done and the frag test never came back.
                    frag_test_pending = false;
                    debug!(peer = %conn.remote_name(), "Fragmentation test unanswered");
                }
            }

            Some(msg) = pmtu_rx.recv() => match msg {
                ControlMsg::PmtuVerified { size } => {
                    if discovery.verified(size) {
                        let epmtu = ETHERNET_OVERHEAD as u16 + discovery.effective();
                        conn.set_effective_pmtu(epmtu);
                        if discovery.is_settled() {
                            info!(peer = %conn.remote_name(), pmtu = epmtu, "PMTU settled");
                        }
                    }
                }
                ControlMsg::FragmentationReceived => {
                    if !frag_works {
                        frag_works = true;
                        frag_test_pending = false;
                        debug!(peer = %conn.remote_name(), "Path fragmentation confirmed");
                    }
                }
                _ => {}
            },
        }
    }
}

/// Encode `first` plus whatever else is already queued into as few
/// datagrams as the payload budget allows.
async fn send_batched(
    conn: &Arc<Connection>,
    udp: &UdpSocket,
    encryptor: &mut dyn Encryptor,
    forward_rx: &mut mpsc::Receiver<ForwardItem>,
    first: ForwardItem,
    max_payload: usize,
) {
    let mut payload = Vec::with_capacity(4096);
    encode_frame_unit(&mut payload, first.src, first.dst, &first.frame);
    while let Ok(item) = forward_rx.try_recv() {
        let unit_len = FRAME_UNIT_OVERHEAD + item.frame.len();
        if payload.len() + unit_len > max_payload {
            send_payload(conn, udp, encryptor, &payload).await;
            payload.clear();
        }
        encode_frame_unit(&mut payload, item.src, item.dst, &item.frame);
    }
    send_payload(conn, udp, encryptor, &payload).await;
}

/// Send one internally generated frame as its own datagram.
async fn send_frame(
    conn: &Arc<Connection>,
    udp: &UdpSocket,
    encryptor: &mut dyn Encryptor,
    frame: &[u8],
) {
    let mut payload = Vec::with_capacity(FRAME_UNIT_OVERHEAD + frame.len());
    encode_frame_unit(&mut payload, conn.local_name, conn.remote_name(), frame);
    send_payload(conn, udp, encryptor, &payload).await;
}

/// Seal a payload and put it on the wire, prefixed with our name so the
/// receiver can demultiplex. Dropped silently while the remote's UDP
/// address is still unknown.
async fn send_payload(
    conn: &Arc<Connection>,
    udp: &UdpSocket,
    encryptor: &mut dyn Encryptor,
    payload: &[u8],
) {
    if !conn.udp_ready() {
        trace!(peer = %conn.remote_name(), "UDP address unknown, dropping payload");
        return;
    }
    let sealed = match encryptor.encrypt(payload) {
        Ok(sealed) => sealed,
        Err(e) => {
            if e.is_fatal() {
                conn.shutdown(&format!("encrypt: {}", e));
            } else {
                warn!(peer = %conn.remote_name(), error = %e, "Encrypt failed, dropping payload");
            }
            return;
        }
    };
    let mut packet = Vec::with_capacity(NAME_SIZE + sealed.len());
    packet.extend_from_slice(conn.local_name.as_slice());
    packet.extend_from_slice(&sealed);
    if let Err(e) = udp.send_to(&packet, conn.udp_addr()).await {
        debug!(peer = %conn.remote_name(), error = %e, "UDP send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmtu_immediate_ceiling_verify() {
        let mut d = PmtuDiscovery::new(1424, 8000);
        let size = d.next_probe().expect("probe");
        assert_eq!(size, 8000);
        assert!(d.verified(8000));
        assert!(d.is_settled());
        assert_eq!(d.effective(), 8000);
    }

    #[test]
    fn test_pmtu_converges_on_true_path_limit() {
        // Oracle: probes up to 4321 come back, larger ones vanish.
        let true_pmtu = 4321u16;
        let mut d = PmtuDiscovery::new(1424, 60000);
        let mut rounds = 0;
        while let Some(size) = d.next_probe() {
            rounds += 1;
            assert!(rounds < 10_000, "search did not terminate");
            if size <= true_pmtu {
                assert!(d.verified(size));
            }
            // Oversize probes are simply never answered; the per-candidate
            // send budget runs out and the search moves down.
        }
        assert!(d.is_settled());
        assert_eq!(d.effective(), true_pmtu);
    }

    #[test]
    fn test_pmtu_settles_at_floor_when_nothing_answers() {
        let mut d = PmtuDiscovery::new(1424, 60000);
        while d.next_probe().is_some() {}
        assert!(d.is_settled());
        assert_eq!(d.effective(), 1424);
    }

    #[test]
    fn test_pmtu_ignores_stale_verification() {
        let mut d = PmtuDiscovery::new(1424, 60000);
        let current = d.next_probe().expect("probe");
        assert!(!d.verified(current - 1));
        assert_eq!(d.effective(), 1424);
    }

    #[test]
    fn test_pmtu_effective_never_decreases() {
        let mut d = PmtuDiscovery::new(1424, 60000);
        let mut best = d.effective();
        while let Some(size) = d.next_probe() {
            if size <= 30000 {
                d.verified(size);
            }
            assert!(d.effective() >= best);
            best = d.effective();
        }
        assert_eq!(d.effective(), 30000);
    }

    #[test]
    fn test_pmtu_degenerate_interval() {
        let mut d = PmtuDiscovery::new(1424, 1424);
        assert!(d.is_settled());
        assert!(d.next_probe().is_none());
        assert_eq!(d.effective(), 1424);
    }
}
