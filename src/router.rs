//! Frame dispatch and orchestration.
//!
//! The router glues the capture device, the shared UDP data socket, the
//! TCP control listener, and the topology machinery together. Task
//! layout:
//!
//! - a blocking sniffer thread draining the capture source
//! - one async task reading the shared UDP socket, demultiplexing
//!   datagrams by the embedded sender name
//! - a TCP accept loop feeding inbound handshakes
//! - the event loop, sole writer of the live connection table
//! - periodic tasks owned elsewhere: gossip, MAC sweep, per-connection
//!   heartbeat and PMTU timers
//!
//! Frames captured locally are attributed to ourself in the MAC cache,
//! then forwarded to the owning peer (or flooded to every known peer
//! when the destination MAC is unknown or multicast). Frames arriving
//! from a peer teach us the remote ownership of their source MAC and
//! are either injected into the local sink or relayed toward the next
//! hop. Oversize frames with DF set produce an ICMP "fragmentation
//! needed" answer toward the original sender instead of a silent drop.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::capture::{PacketSink, PacketSource};
use crate::config::Config;
use crate::connection::{
    accept_connection, cross_connection_winner, maker::ConnectionMaker, ConnEvent, Connection,
    ConnectionError, ConnectionMap, CrossWinner, HandshakeParams,
};
use crate::ethernet::{icmp_frag_needed, DecodedFrame, ETHERNET_OVERHEAD};
use crate::gossip::{GossipChannel, GossipError, Gossiper};
use crate::maccache::MacCache;
use crate::name::{NameError, PeerName, NAME_SIZE};
use crate::peer::{Peer, Peers};
use crate::protocol::{
    classify_special, is_special, ControlMsg, FrameUnitIter, SpecialFrame, MAX_UDP_PACKET_SIZE,
};
use crate::routes::Routes;

/// Gossip topic carrying peer topology records.
pub const TOPOLOGY_TOPIC: u32 = 1;

/// Link metric advertised for our own direct connections.
const DIRECT_METRIC: u16 = 1;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid peer name: {0}")]
    Name(#[from] NameError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Router {
    config: Config,
    ourself: PeerName,
    nickname: String,
    peers: Arc<Peers>,
    routes: Arc<Routes>,
    mac_cache: Arc<MacCache>,
    conns: ConnectionMap,
    live: Arc<AtomicUsize>,
    maker: ConnectionMaker,
    topology: Arc<GossipChannel>,
    udp: Arc<UdpSocket>,
    sink: Mutex<Box<dyn PacketSink + Send>>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
}

impl Router {
    /// Bind sockets, wire up the subsystems, and spawn every task. The
    /// returned handle is for status inspection and local injection; the
    /// router runs until the process exits.
    pub async fn start(
        config: Config,
        source: Box<dyn PacketSource + Send>,
        sink: Box<dyn PacketSink + Send>,
    ) -> Result<Arc<Self>, RouterError> {
        let ourself = match &config.router.name {
            Some(name) => name.parse()?,
            None => PeerName::random(),
        };
        let nickname = config
            .router
            .nickname
            .clone()
            .unwrap_or_else(|| ourself.to_string());

        let mac_cache = Arc::new(MacCache::new(
            config.mac_cache.max_age(),
            Box::new(|mac, peer| {
                debug!(mac = %mac, peer = %peer, "MAC cache entry expired");
            }),
        ));
        let gc_cache = mac_cache.clone();
        let peers = Arc::new(Peers::new(
            Peer::new(ourself, nickname.clone()),
            Box::new(move |peer| {
                info!(peer = %peer.full_name(), "Peer garbage collected");
                gc_cache.delete(peer.name);
            }),
        ));
        let routes = Arc::new(Routes::new(peers.clone()));

        let bind = format!("0.0.0.0:{}", config.router.port);
        let listener = TcpListener::bind(&bind).await?;
        let udp = Arc::new(UdpSocket::bind(&bind).await?);
        info!(
            name = %ourself,
            nickname = %nickname,
            addr = %bind,
            encrypted = config.router.password.is_some(),
            "Router starting"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let params = HandshakeParams {
            name: ourself,
            nickname: nickname.clone(),
            password: config
                .router
                .password
                .as_ref()
                .map(|p| p.as_bytes().to_vec()),
            timing: config.connection.clone(),
        };
        let live = Arc::new(AtomicUsize::new(0));
        let maker = ConnectionMaker::start(
            params.clone(),
            udp.clone(),
            events_tx.clone(),
            live.clone(),
            config.router.conn_limit,
        );

        let conns: ConnectionMap = Arc::new(Mutex::new(Default::default()));
        let gossiper = Arc::new(TopologyGossiper {
            peers: peers.clone(),
            routes: routes.clone(),
            maker: maker.clone(),
        });
        let topology = GossipChannel::new(TOPOLOGY_TOPIC, gossiper, conns.clone());

        let router = Arc::new(Self {
            ourself,
            nickname,
            peers,
            routes,
            mac_cache,
            conns,
            live,
            maker,
            topology,
            udp,
            sink: Mutex::new(sink),
            events_tx,
            config,
        });

        router.mac_cache.start_sweeper(router.config.mac_cache.sweep_interval());
        router.topology.start_periodic(router.config.gossip.interval());
        router.spawn_event_loop(events_rx);
        router.spawn_acceptor(listener, params);
        router.spawn_udp_reader();
        router.spawn_sniffer(source);

        for addr in &router.config.peers {
            router.maker.initiate(addr);
        }
        Ok(router)
    }

    pub fn name(&self) -> PeerName {
        self.ourself
    }

    /// Names of peers with a live direct connection.
    pub fn connected_peers(&self) -> Vec<PeerName> {
        let mut names: Vec<PeerName> = self.lock_conns().keys().copied().collect();
        names.sort();
        names
    }

    /// Every peer the registry currently knows, ourself included.
    pub fn known_peers(&self) -> crate::peer::PeerNameSet {
        self.peers.names()
    }

    /// Next hop toward `dest`, when reachable.
    pub fn next_hop(&self, dest: PeerName) -> Option<PeerName> {
        self.routes.unicast(dest)
    }

    /// Live connection to a directly connected peer.
    pub fn connection(&self, peer: PeerName) -> Option<Arc<Connection>> {
        self.lock_conns().get(&peer).cloned()
    }

    /// Ask the maker to start dialing `addr`.
    pub fn connect_to(&self, addr: &str) {
        self.maker.initiate(addr);
    }

    /// Stop reconnecting to `addr` and close any live connection to it.
    pub fn forget(&self, addr: &str) {
        self.maker.forget(addr);
        let doomed: Vec<Arc<Connection>> = {
            let conns = self.lock_conns();
            conns
                .values()
                .filter(|c| c.remote_addr().to_string() == addr)
                .cloned()
                .collect()
        };
        for conn in doomed {
            conn.shutdown("peer removed");
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<ConnEvent>) {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnEvent::Established(conn) => router.register_connection(conn),
                    ConnEvent::Dead { id, remote, reason } => {
                        router.unregister_connection(id, remote, &reason)
                    }
                    ConnEvent::Gossip { from, msg } => router.dispatch_gossip(from, msg),
                }
            }
        });
    }

    fn register_connection(&self, conn: Arc<Connection>) {
        let remote = conn.remote_name();
        {
            let mut conns = self.lock_conns();
            if let Some(existing) = conns.get(&remote) {
                match cross_connection_winner(
                    self.ourself,
                    remote,
                    existing.is_outbound(),
                    conn.is_outbound(),
                ) {
                    CrossWinner::Existing => {
                        debug!(peer = %conn.remote_full_name(), "Dropping duplicate connection");
                        conn.shutdown("lost connection tie-break");
                        return;
                    }
                    CrossWinner::New => {
                        debug!(peer = %existing.remote_full_name(), "Replacing crossed connection");
                        existing.shutdown("lost connection tie-break");
                    }
                }
            }
            conns.insert(remote, conn.clone());
        }
        self.live.store(self.lock_conns().len(), Ordering::Relaxed);

        self.peers
            .fetch_with_default(Peer::new(remote, conn.remote_nickname()));
        self.peers.add_local_ref(remote);
        let ourself = self
            .peers
            .update_ourself(|p| p.add_connection(remote, DIRECT_METRIC));
        self.routes.recalculate();

        // Tell the mesh about the new edge and catch the newcomer up.
        let delta = self
            .peers
            .encode_peers(&[ourself.name].into_iter().collect());
        self.topology.broadcast(delta, None);
        self.topology.gossip_to(remote);
    }

    fn unregister_connection(&self, id: u64, remote: PeerName, reason: &str) {
        let removed = {
            let mut conns = self.lock_conns();
            match conns.get(&remote) {
                Some(existing) if existing.id() == id => {
                    conns.remove(&remote);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            // A tie-break loser; the surviving connection stays put.
            return;
        }
        self.maker.peer_disconnected(remote, reason);
        self.live.store(self.lock_conns().len(), Ordering::Relaxed);

        let ourself = self.peers.update_ourself(|p| p.remove_connection(remote));
        self.peers.drop_local_ref(remote);
        // The dropped ref may have been the last thing keeping the peer's
        // record (and its MAC entries) alive; no further gossip is
        // guaranteed to arrive and sweep it for us.
        self.peers.garbage_collect();
        self.routes.recalculate();
        let delta = self
            .peers
            .encode_peers(&[ourself.name].into_iter().collect());
        self.topology.broadcast(delta, None);
    }

    fn dispatch_gossip(&self, from: PeerName, msg: ControlMsg) {
        let topic = match &msg {
            ControlMsg::Gossip { topic, .. }
            | ControlMsg::GossipBroadcast { topic, .. }
            | ControlMsg::GossipUnicast { topic, .. } => *topic,
            _ => return,
        };
        if topic == self.topology.topic() {
            self.topology.handle(from, msg);
        } else {
            debug!(topic, from = %from, "Gossip for unknown topic");
        }
    }

    // ========================================================================
    // Inbound TCP
    // ========================================================================

    fn spawn_acceptor(self: &Arc<Self>, listener: TcpListener, params: HandshakeParams) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                };
                if router.live.load(Ordering::Relaxed) >= router.config.router.conn_limit {
                    warn!(addr = %addr, "Connection limit reached, rejecting");
                    continue;
                }
                let params = params.clone();
                let udp = router.udp.clone();
                let events = router.events_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(tcp, false, params, udp, events).await {
                        debug!(addr = %addr, error = %e, "Inbound handshake failed");
                    }
                });
            }
        });
    }

    // ========================================================================
    // Capture path
    // ========================================================================

    fn spawn_sniffer(self: &Arc<Self>, mut source: Box<dyn PacketSource + Send>) {
        let router = self.clone();
        tokio::task::spawn_blocking(move || loop {
            match source.read_packet() {
                Ok(frame) => router.handle_captured_frame(&frame),
                Err(e) => {
                    warn!(error = %e, "Capture source closed");
                    break;
                }
            }
        });
    }

    fn handle_captured_frame(&self, frame: &[u8]) {
        let Some(dec) = DecodedFrame::decode(frame) else {
            return;
        };
        if dec.drop_frame() {
            return;
        }
        // A frame whose source MAC belongs to a remote peer is one we
        // injected ourselves, looping back through the capture device.
        if let Some(owner) = self.mac_cache.lookup(dec.src_mac) {
            if owner != self.ourself {
                return;
            }
        }
        if self.mac_cache.enter(dec.src_mac, self.ourself) {
            debug!(mac = %dec.src_mac, "Discovered local MAC");
        }

        if dec.dst_mac.is_multicast() {
            self.flood_frame(&dec, frame);
            return;
        }
        match self.mac_cache.lookup(dec.dst_mac) {
            Some(peer) if peer == self.ourself => {
                // Local destination; the kernel delivers it without us.
            }
            Some(peer) => self.forward_frame(peer, &dec, frame, true),
            None => self.flood_frame(&dec, frame),
        }
    }

    /// Forward toward `dst_peer` via the route table. `local_origin`
    /// decides where a too-big error goes: back into the local sink, or
    /// across the mesh toward the sending peer.
    fn forward_frame(&self, dst_peer: PeerName, dec: &DecodedFrame, frame: &[u8], local_origin: bool) {
        let Some(next_hop) = self.routes.unicast(dst_peer) else {
            trace!(dst = %dst_peer, "No route, dropping frame");
            return;
        };
        let conn = {
            let conns = self.lock_conns();
            conns.get(&next_hop).cloned()
        };
        let Some(conn) = conn else {
            trace!(next_hop = %next_hop, "Route points at missing connection");
            return;
        };
        let src_peer = if local_origin {
            self.ourself
        } else {
            match self.mac_cache.lookup(dec.src_mac) {
                Some(owner) => owner,
                None => self.ourself,
            }
        };
        match conn.forward(dec.dont_fragment(), frame, src_peer, dst_peer) {
            Ok(()) => {}
            Err(ConnectionError::FrameTooBig { epmtu, .. }) => {
                self.answer_frame_too_big(frame, epmtu, src_peer, local_origin);
            }
            Err(e) => debug!(peer = %conn.remote_name(), error = %e, "Forward failed"),
        }
    }

    /// Copy the frame toward every known peer; receivers relay nothing
    /// since each copy is addressed to its final destination.
    fn flood_frame(&self, dec: &DecodedFrame, frame: &[u8]) {
        for peer in self.peers.names() {
            if peer == self.ourself {
                continue;
            }
            self.forward_frame(peer, dec, frame, true);
        }
    }

    /// Synthesize the ICMP "fragmentation needed" answer and send it
    /// back the way the original frame came.
    fn answer_frame_too_big(
        &self,
        original: &[u8],
        epmtu: u16,
        src_peer: PeerName,
        local_origin: bool,
    ) {
        let mtu = epmtu.saturating_sub(ETHERNET_OVERHEAD as u16);
        let Some(icmp) = icmp_frag_needed(original, mtu) else {
            return;
        };
        debug!(mtu, "Answering oversize DF frame with ICMP fragmentation needed");
        if local_origin {
            self.inject_local(&icmp);
        } else if let Some(dec) = DecodedFrame::decode(&icmp) {
            self.forward_frame(src_peer, &dec, &icmp, true);
        }
    }

    fn inject_local(&self, frame: &[u8]) {
        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = sink.write_packet(frame) {
            warn!(error = %e, "Local inject failed");
        }
    }

    // ========================================================================
    // UDP path
    // ========================================================================

    fn spawn_udp_reader(self: &Arc<Self>) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
            loop {
                let (len, from) = match router.udp.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };
                router.handle_udp_packet(&buf[..len], from);
            }
        });
    }

    fn handle_udp_packet(&self, packet: &[u8], from: std::net::SocketAddr) {
        let Some(sender) = packet
            .get(..NAME_SIZE)
            .and_then(|head| PeerName::from_slice(head).ok())
        else {
            trace!(addr = %from, len = packet.len(), "Runt datagram");
            return;
        };
        let conn = {
            let conns = self.lock_conns();
            conns.get(&sender).cloned()
        };
        let Some(conn) = conn else {
            trace!(sender = %sender, addr = %from, "Datagram from unconnected peer");
            return;
        };
        let payload = match conn.decrypt(&packet[NAME_SIZE..]) {
            Ok(payload) => payload,
            Err(e) if e.is_fatal() => {
                conn.shutdown(&format!("decrypt: {}", e));
                return;
            }
            Err(e) => {
                debug!(peer = %sender, error = %e, "Dropping undecryptable datagram");
                return;
            }
        };
        for unit in FrameUnitIter::new(&payload) {
            match unit {
                Ok((src, dst, frame)) => {
                    if is_special(frame) {
                        self.handle_special_frame(&conn, from, frame);
                    } else {
                        self.handle_remote_frame(src, dst, frame);
                    }
                }
                Err(e) => {
                    debug!(peer = %sender, error = %e, "Malformed frame batch");
                    break;
                }
            }
        }
    }

    fn handle_special_frame(
        &self,
        conn: &Arc<Connection>,
        from: std::net::SocketAddr,
        frame: &[u8],
    ) {
        match classify_special(frame) {
            Some(SpecialFrame::Heartbeat(counter)) => {
                trace!(peer = %conn.remote_name(), counter, "Heartbeat");
                conn.heartbeat_received(from);
            }
            Some(SpecialFrame::FragTest) => {
                conn.send_control(ControlMsg::FragmentationReceived);
            }
            Some(SpecialFrame::PmtuProbe(size)) => {
                conn.send_control(ControlMsg::PmtuVerified { size });
            }
            None => {}
        }
    }

    fn handle_remote_frame(&self, src_peer: PeerName, dst_peer: PeerName, frame: &[u8]) {
        let Some(dec) = DecodedFrame::decode(frame) else {
            return;
        };
        if self.mac_cache.enter(dec.src_mac, src_peer) {
            info!(mac = %dec.src_mac, peer = %src_peer, "Discovered remote MAC");
        }
        if dst_peer == self.ourself {
            self.inject_local(frame);
        } else {
            self.forward_frame(dst_peer, &dec, frame, false);
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Human-readable status summary.
    pub fn status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Router {}({})", self.ourself, self.nickname);
        let conns = self.lock_conns();
        let _ = writeln!(out, "Connections ({}):", conns.len());
        let mut lines: Vec<String> = conns.values().map(|c| format!("  {}", c)).collect();
        lines.sort();
        for line in lines {
            let _ = writeln!(out, "{}", line);
        }
        drop(conns);
        let _ = writeln!(out, "Targets:");
        for target in self.maker.report() {
            let _ = writeln!(
                out,
                "  {} {} attempts={}{}",
                target.address,
                target.state,
                target.attempts,
                target
                    .last_error
                    .map(|e| format!(" last_error={}", e))
                    .unwrap_or_default(),
            );
        }
        let _ = writeln!(out, "{}", self.peers.report());
        let _ = writeln!(out, "{}", self.routes.report());
        let _ = write!(out, "{}", self.mac_cache.report());
        out
    }

    fn lock_conns(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<PeerName, Arc<Connection>>> {
        self.conns.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ============================================================================
// Topology gossip
// ============================================================================

/// Topology state owner behind the gossip channel: merges incoming peer
/// records, then recomputes routes and nudges the connection maker.
struct TopologyGossiper {
    peers: Arc<Peers>,
    routes: Arc<Routes>,
    maker: ConnectionMaker,
}

impl TopologyGossiper {
    fn apply(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GossipError> {
        let (applied, new) = self.peers.apply_update(payload)?;
        if applied.is_empty() {
            return Ok(None);
        }
        if !new.is_empty() {
            debug!(count = new.len(), "Learned of new peers via gossip");
        }
        self.routes.recalculate();
        self.maker.refresh();
        Ok(Some(self.peers.encode_peers(&applied)))
    }
}

impl Gossiper for TopologyGossiper {
    fn gossip(&self) -> Vec<u8> {
        self.peers.encode_peers(&self.peers.names())
    }

    fn on_gossip(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GossipError> {
        self.apply(payload)
    }

    fn on_gossip_broadcast(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GossipError> {
        self.apply(payload)
    }

    fn on_gossip_unicast(&self, src: PeerName, _payload: &[u8]) -> Result<(), GossipError> {
        // Topology never travels point-to-point.
        debug!(src = %src, "Ignoring unicast on topology topic");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemoryDevice;
    use crate::ethernet::tests::make_ipv4_frame;
    use crate::ethernet::{ETHERTYPE_IPV4, IPV4_HEADER_MIN};
    use std::sync::mpsc::{Receiver, Sender};
    use std::time::Duration;

    struct TestRouter {
        router: Arc<Router>,
        injector: Sender<Vec<u8>>,
        written: Mutex<(Receiver<Vec<u8>>, Vec<Vec<u8>>)>,
    }

    impl TestRouter {
        /// Push a frame into this router's capture source, as if sniffed
        /// from the local network.
        fn inject(&self, frame: Vec<u8>) {
            self.injector.send(frame).expect("router stopped");
        }

        /// Whether any frame matching `pred` has reached the local sink.
        fn saw(&self, pred: impl Fn(&[u8]) -> bool) -> bool {
            let mut guard = self.written.lock().unwrap();
            let (rx, seen) = &mut *guard;
            seen.extend(rx.try_iter());
            seen.iter().any(|f| pred(f))
        }
    }

    async fn start_router(port: u16, peers: Vec<String>) -> TestRouter {
        let mut config = Config::default();
        config.router.port = port;
        config.gossip.interval_secs = 1;
        config.peers = peers;
        let (device, written) = MemoryDevice::new();
        let injector = device.injector();
        let sink = device.sink();
        let router = Router::start(config, Box::new(device), Box::new(sink))
            .await
            .expect("router start");
        TestRouter {
            router,
            injector,
            written: Mutex::new((written, Vec::new())),
        }
    }

    /// Find a port number currently free for both TCP and UDP.
    fn free_port() -> u16 {
        for _ in 0..32 {
            let tcp = std::net::TcpListener::bind("127.0.0.1:0").expect("bind tcp");
            let port = tcp.local_addr().expect("local addr").port();
            if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
                return port;
            }
        }
        panic!("no free port found");
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Ethernet frame with an arbitrary non-IP body.
    fn make_frame(src: [u8; 6], dst: [u8; 6]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&[0u8; 8]);
        frame
    }

    const HOST_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0xaa];
    const HOST_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0xbb];
    const BROADCAST: [u8; 6] = [0xff; 6];

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_routers_flood_learn_and_deliver() {
        let (pa, pb) = (free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![]).await;

        wait_until("connection on both ends", || {
            a.router.connected_peers().len() == 1 && b.router.connected_peers().len() == 1
        })
        .await;

        // A host behind B announces itself; the broadcast floods to A
        // and teaches A which router owns HOST_B.
        let hello = make_frame(HOST_B, BROADCAST);
        let expected = hello.clone();
        wait_until("flooded frame at A", || {
            b.inject(hello.clone());
            a.saw(|f| f == expected.as_slice())
        })
        .await;

        // The reply travels as learned unicast the other way.
        let reply = make_frame(HOST_A, HOST_B);
        let expected = reply.clone();
        wait_until("unicast frame at B", || {
            a.inject(reply.clone());
            b.saw(|f| f == expected.as_slice())
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_router_line_converges_and_relays() {
        let (pa, pb, pc) = (free_port(), free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![]).await;
        let c = start_router(pc, vec![format!("127.0.0.1:{}", pb)]).await;

        let (an, bn, cn) = (a.router.name(), b.router.name(), c.router.name());

        // Gossip must carry knowledge of C across B to A, and the route
        // from A to C must go through B.
        wait_until("A learns of C via gossip", || {
            a.router.known_peers().contains(&cn)
        })
        .await;
        wait_until("route A->C via B", || a.router.next_hop(cn) == Some(bn)).await;
        wait_until("route C->A via B", || c.router.next_hop(an) == Some(bn)).await;

        // Host behind C floods; the frame must cross B to reach A.
        let hello = make_frame(HOST_B, BROADCAST);
        let expected = hello.clone();
        wait_until("relayed flood at A", || {
            c.inject(hello.clone());
            a.saw(|f| f == expected.as_slice())
        })
        .await;

        // Unicast reply A -> C relayed by B.
        let reply = make_frame(HOST_A, HOST_B);
        let expected = reply.clone();
        wait_until("relayed unicast at C", || {
            a.inject(reply.clone());
            c.saw(|f| f == expected.as_slice())
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_dial_settles_on_one_connection() {
        let (pa, pb) = (free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![format!("127.0.0.1:{}", pa)]).await;

        wait_until("both ends connected", || {
            a.router.connected_peers().len() == 1 && b.router.connected_peers().len() == 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(a.router.connected_peers(), vec![b.router.name()]);
        assert_eq!(b.router.connected_peers(), vec![a.router.name()]);

        // The surviving connection is the one dialed by the lower name.
        let (lower, higher) = if a.router.name() < b.router.name() {
            (&a, &b)
        } else {
            (&b, &a)
        };
        let down = lower.router.connection(higher.router.name()).unwrap();
        let up = higher.router.connection(lower.router.name()).unwrap();
        assert!(down.is_outbound());
        assert!(!up.is_outbound());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forgotten_peer_record_is_swept() {
        let (pa, pb) = (free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![]).await;

        wait_until("connection on both ends", || {
            a.router.connected_peers().len() == 1 && b.router.connected_peers().len() == 1
        })
        .await;
        let (an, bn) = (a.router.name(), b.router.name());
        assert!(a.router.known_peers().contains(&bn));

        // Losing the link for good must also retire the dead peer's
        // record on both ends; no further gossip will sweep it for us.
        a.router.forget(&format!("127.0.0.1:{}", pb));
        wait_until("A sweeps B's record", || {
            !a.router.known_peers().contains(&bn)
        })
        .await;
        wait_until("B sweeps A's record", || {
            !b.router.known_peers().contains(&an)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_double_shutdown_evicts_once_and_redials() {
        use crate::connection::ConnectionState;

        let (pa, pb) = (free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![]).await;

        wait_until("connection on both ends", || {
            a.router.connected_peers().len() == 1 && b.router.connected_peers().len() == 1
        })
        .await;
        let bn = b.router.name();
        let first = a.router.connection(bn).unwrap();
        let old_id = first.id();

        // Closing an already-closed connection must change nothing.
        first.shutdown("link flap");
        first.shutdown("link flap");
        assert_eq!(first.state(), ConnectionState::Dead);

        wait_until("old connection evicted on both ends", || {
            a.router.connected_peers().is_empty() && b.router.connected_peers().is_empty()
        })
        .await;

        // The maker retries the target as for a single close, and the
        // replacement is a distinct live connection.
        wait_until("replacement connection at A", || {
            a.router
                .connection(bn)
                .map(|c| c.id() != old_id && c.state() == ConnectionState::Established)
                .unwrap_or(false)
        })
        .await;
        wait_until("replacement connection at B", || {
            b.router.connected_peers().len() == 1
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_oversize_df_frame_answered_with_icmp() {
        let (pa, pb) = (free_port(), free_port());
        let a = start_router(pa, vec![format!("127.0.0.1:{}", pb)]).await;
        let b = start_router(pb, vec![]).await;

        wait_until("connection on both ends", || {
            a.router.connected_peers().len() == 1 && b.router.connected_peers().len() == 1
        })
        .await;
        let conn = a.router.connection(b.router.name()).unwrap();

        // A DF frame bigger than the link budget must come back as an
        // ICMP fragmentation-needed answer, not vanish.
        let big = make_ipv4_frame(true, 400);
        wait_until("ICMP answer at A", || {
            conn.set_effective_pmtu(100);
            a.inject(big.clone());
            a.saw(|f| {
                f.len() > ETHERNET_OVERHEAD + IPV4_HEADER_MIN + 2
                    && f[ETHERNET_OVERHEAD + 9] == 1
                    && f[ETHERNET_OVERHEAD + IPV4_HEADER_MIN] == 3
                    && f[ETHERNET_OVERHEAD + IPV4_HEADER_MIN + 1] == 4
            })
        })
        .await;
    }
}
