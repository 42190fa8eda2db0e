//! Outbound connection management.
//!
//! The maker is a small actor owning the set of dial targets. Each
//! target cycles through idle, attempting, and connected; failures
//! schedule a retry with exponential backoff (doubling from the
//! configured initial interval up to the cap), and a successful
//! establishment resets the backoff. The router feeds it lifecycle
//! notifications; topology changes nudge it awake via [`ConnectionMaker::refresh`]
//! so freshly due targets are dialed without waiting out the poll timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{accept_connection, ConnEvent, HandshakeParams};
use crate::config::DEFAULT_PORT;
use crate::name::PeerName;

/// Commands accepted by the maker actor.
enum MakerCmd {
    Initiate(String),
    Forget(String),
    Established { target: String, peer: PeerName },
    DialFailed { target: String, reason: String },
    PeerDisconnected { peer: PeerName, reason: String },
    Refresh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TargetState {
    Idle,
    Attempting,
    Connected,
}

struct Target {
    state: TargetState,
    attempt_count: u32,
    try_after: Instant,
    try_interval: Duration,
    /// Peer the last successful dial reached; correlates later
    /// disconnect reports, whose socket addresses need not match the
    /// configured target string.
    peer: Option<PeerName>,
    last_error: Option<String>,
}

type TargetTable = Arc<Mutex<HashMap<String, Target>>>;

/// Handle to the maker actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionMaker {
    cmd_tx: mpsc::UnboundedSender<MakerCmd>,
    targets: TargetTable,
}

/// One line of the maker's status report.
#[derive(Clone, Debug)]
pub struct TargetReport {
    pub address: String,
    pub state: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ConnectionMaker {
    /// Spawn the actor.
    ///
    /// `live` is the router-maintained count of established connections;
    /// dialing pauses while it sits at `conn_limit`.
    pub fn start(
        params: HandshakeParams,
        udp: Arc<UdpSocket>,
        events: mpsc::UnboundedSender<ConnEvent>,
        live: Arc<AtomicUsize>,
        conn_limit: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let targets: TargetTable = Arc::new(Mutex::new(HashMap::new()));
        let actor = MakerActor {
            params,
            udp,
            events,
            live,
            conn_limit,
            targets: targets.clone(),
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx, targets }
    }

    /// Start (and keep) dialing `addr` until told to forget it.
    pub fn initiate(&self, addr: &str) {
        let _ = self.cmd_tx.send(MakerCmd::Initiate(normalize_addr(addr)));
    }

    /// Stop dialing `addr`. An established connection to it is the
    /// router's to close; this only stops reconnect attempts.
    pub fn forget(&self, addr: &str) {
        let _ = self.cmd_tx.send(MakerCmd::Forget(normalize_addr(addr)));
    }

    /// A connection to `peer` died; targets bound to it retry.
    pub fn peer_disconnected(&self, peer: PeerName, reason: &str) {
        let _ = self.cmd_tx.send(MakerCmd::PeerDisconnected {
            peer,
            reason: reason.to_string(),
        });
    }

    /// Topology changed; look for newly due work immediately.
    pub fn refresh(&self) {
        let _ = self.cmd_tx.send(MakerCmd::Refresh);
    }

    /// Current target table, for the status report.
    pub fn report(&self) -> Vec<TargetReport> {
        let targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<TargetReport> = targets
            .iter()
            .map(|(addr, t)| TargetReport {
                address: addr.clone(),
                state: format!("{:?}", t.state).to_lowercase(),
                attempts: t.attempt_count,
                last_error: t.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    fn established(&self, target: String, peer: PeerName) {
        let _ = self.cmd_tx.send(MakerCmd::Established { target, peer });
    }

    fn dial_failed(&self, target: String, reason: String) {
        let _ = self.cmd_tx.send(MakerCmd::DialFailed { target, reason });
    }
}

struct MakerActor {
    params: HandshakeParams,
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<ConnEvent>,
    live: Arc<AtomicUsize>,
    conn_limit: usize,
    targets: TargetTable,
    cmd_tx: mpsc::UnboundedSender<MakerCmd>,
}

impl MakerActor {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<MakerCmd>) {
        loop {
            let wakeup = self.next_due().unwrap_or_else(|| {
                Instant::now() + Duration::from_secs(60)
            });
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(wakeup) => {}
            }
            self.dial_due();
        }
    }

    fn handle(&self, cmd: MakerCmd) {
        let mut targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        match cmd {
            MakerCmd::Initiate(addr) => {
                targets.entry(addr.clone()).or_insert_with(|| {
                    debug!(addr = %addr, "New connection target");
                    Target {
                        state: TargetState::Idle,
                        attempt_count: 0,
                        try_after: Instant::now(),
                        try_interval: self.params.timing.retry_initial(),
                        peer: None,
                        last_error: None,
                    }
                });
            }
            MakerCmd::Forget(addr) => {
                if targets.remove(&addr).is_some() {
                    info!(addr = %addr, "Forgetting connection target");
                }
            }
            MakerCmd::Established { target, peer } => {
                if let Some(t) = targets.get_mut(&target) {
                    t.state = TargetState::Connected;
                    t.attempt_count = 0;
                    t.try_interval = self.params.timing.retry_initial();
                    t.peer = Some(peer);
                    t.last_error = None;
                }
            }
            MakerCmd::DialFailed { target, reason } => {
                if let Some(t) = targets.get_mut(&target) {
                    schedule_retry(t, &reason, self.params.timing.retry_max());
                    debug!(addr = %target, reason = %reason, "Dial failed, retry scheduled");
                }
            }
            MakerCmd::PeerDisconnected { peer, reason } => {
                for (addr, t) in targets.iter_mut() {
                    if t.state == TargetState::Connected && t.peer == Some(peer) {
                        schedule_retry(t, &reason, self.params.timing.retry_max());
                        debug!(addr = %addr, peer = %peer, reason = %reason, "Connection lost, retry scheduled");
                    }
                }
            }
            MakerCmd::Refresh => {}
        }
    }

    /// Earliest retry deadline among idle targets.
    fn next_due(&self) -> Option<Instant> {
        let targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        targets
            .values()
            .filter(|t| t.state == TargetState::Idle)
            .map(|t| t.try_after)
            .min()
    }

    /// Kick off a dial task for every idle target whose time has come.
    fn dial_due(&self) {
        let now = Instant::now();
        let mut targets = self.targets.lock().unwrap_or_else(|p| p.into_inner());
        for (addr, t) in targets.iter_mut() {
            if t.state != TargetState::Idle || t.try_after > now {
                continue;
            }
            if self.live.load(Ordering::Relaxed) >= self.conn_limit {
                warn!(addr = %addr, limit = self.conn_limit, "Connection limit reached, deferring dial");
                t.try_after = now + t.try_interval;
                continue;
            }
            t.state = TargetState::Attempting;
            t.attempt_count += 1;
            self.spawn_dial(addr.clone());
        }
    }

    fn spawn_dial(&self, addr: String) {
        let params = self.params.clone();
        let udp = self.udp.clone();
        let events = self.events.clone();
        let maker = ConnectionMaker {
            cmd_tx: self.cmd_tx.clone(),
            targets: self.targets.clone(),
        };
        tokio::spawn(async move {
            debug!(addr = %addr, "Dialing");
            let result = async {
                let tcp = TcpStream::connect(&addr).await?;
                accept_connection(tcp, true, params, udp, events).await
            }
            .await;
            match result {
                Ok(conn) => maker.established(addr, conn.remote_name()),
                Err(e) => maker.dial_failed(addr, e.to_string()),
            }
        });
    }
}

/// Put a target back into rotation with doubled (capped) backoff.
fn schedule_retry(t: &mut Target, reason: &str, cap: Duration) {
    t.state = TargetState::Idle;
    t.try_after = Instant::now() + t.try_interval;
    t.try_interval = (t.try_interval * 2).min(cap);
    t.last_error = Some(reason.to_string());
}

/// Append the default port when the address has none.
pub fn normalize_addr(addr: &str) -> String {
    let has_port = match addr.rsplit_once(':') {
        Some((head, tail)) => {
            !tail.is_empty()
                && tail.chars().all(|c| c.is_ascii_digit())
                // A colon in the head means bare IPv6 unless bracketed.
                && (!head.contains(':') || head.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}
