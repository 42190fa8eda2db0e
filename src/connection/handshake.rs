//! Connection establishment: framing, identity exchange, key agreement.
//!
//! Both sides send their handshake message first and then read the
//! remote's, so neither blocks the other. With a password configured the
//! handshake also carries an ephemeral public key; after ECDH both ends
//! exchange an encrypted key-confirmation probe, which is what turns "we
//! derived *some* keys" into "we derived the *same* keys" — a password
//! mismatch fails here, before any data flows.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::forwarder;
use super::{ConnEvent, Connection, ConnectionError, ConnectionState, DEFAULT_PMTU};
use crate::config::ConnectionConfig;
use crate::crypto::{
    derive_session_keys, AeadDecryptor, AeadEncryptor, Decryptor, Encryptor, EphemeralKey,
    NullDecryptor, NullEncryptor, KEY_CONFIRM_PROBE,
};
use crate::name::PeerName;
use crate::protocol::{ControlMsg, HandshakeFields, ProtocolError, MAX_TCP_MSG_SIZE, PROTOCOL_VERSION};

/// How long the whole handshake may take before the attempt is abandoned.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Our side of the handshake, shared by every connection attempt.
#[derive(Clone)]
pub struct HandshakeParams {
    pub name: PeerName,
    pub nickname: String,
    pub password: Option<Vec<u8>>,
    pub timing: ConnectionConfig,
}

/// Write one length-prefixed control message.
pub async fn write_msg<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMsg,
) -> Result<(), ConnectionError> {
    let body = msg.encode();
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed control message.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMsg, ConnectionError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_TCP_MSG_SIZE {
        return Err(ConnectionError::Protocol(ProtocolError::MsgTooLarge(len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(ControlMsg::decode(&body)?)
}

/// Run the handshake on a fresh TCP stream and, on success, spin up the
/// established connection's tasks and deliver it to the router's event
/// loop. `outbound` records who dialed, for the crossing-dial tie-break.
pub async fn accept_connection(
    tcp: TcpStream,
    outbound: bool,
    params: HandshakeParams,
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> Result<Arc<Connection>, ConnectionError> {
    let remote_addr = tcp.peer_addr()?;
    debug!(addr = %remote_addr, outbound, "Starting handshake");
    tcp.set_nodelay(true)?;
    let (read_half, write_half) = tcp.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let outcome = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_handshake(&mut reader, &mut writer, &params),
    )
    .await
    .map_err(|_| ConnectionError::Timeout("handshake"))??;

    let conn = spawn_established(
        reader,
        writer,
        outbound,
        remote_addr,
        outcome,
        &params,
        udp,
        events,
    );
    info!(peer = %conn.remote_full_name(), addr = %remote_addr, outbound, "Connection established");
    Ok(conn)
}

/// What the handshake agreed on.
struct HandshakeOutcome {
    fields: HandshakeFields,
    encryptor: Box<dyn Encryptor>,
    decryptor: Box<dyn Decryptor>,
}

async fn run_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    params: &HandshakeParams,
) -> Result<HandshakeOutcome, ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ephemeral = params.password.as_ref().map(|_| EphemeralKey::generate());

    write_msg(
        writer,
        &ControlMsg::Handshake(HandshakeFields {
            name: params.name,
            nickname: params.nickname.clone(),
            version: PROTOCOL_VERSION,
            public_key: ephemeral.as_ref().map(|k| k.public_bytes().to_vec()),
        }),
    )
    .await?;

    let fields = match read_msg(reader).await? {
        ControlMsg::Handshake(fields) => fields,
        other => {
            return Err(ConnectionError::Handshake(format!(
                "expected handshake, got {:?}",
                other
            )))
        }
    };

    if fields.version != PROTOCOL_VERSION {
        return Err(ConnectionError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: fields.version,
        });
    }
    if fields.name == params.name {
        return Err(ConnectionError::SelfConnection);
    }

    let (encryptor, decryptor): (Box<dyn Encryptor>, Box<dyn Decryptor>) =
        match (&params.password, &ephemeral, &fields.public_key) {
            (None, _, None) => (Box::new(NullEncryptor), Box::new(NullDecryptor)),
            (Some(password), Some(ephemeral), Some(remote_key)) => {
                let shared = ephemeral.agree(remote_key)?;
                let keys = derive_session_keys(&shared, password, params.name, fields.name);
                let mut encryptor = AeadEncryptor::new(&keys.tx);
                let mut decryptor = AeadDecryptor::new(&keys.rx);

                // Key confirmation: prove both ends derived the same keys.
                let sealed = encryptor.encrypt(KEY_CONFIRM_PROBE)?;
                write_msg(writer, &ControlMsg::KeyConfirm(sealed)).await?;
                let their_sealed = match read_msg(reader).await? {
                    ControlMsg::KeyConfirm(sealed) => sealed,
                    other => {
                        return Err(ConnectionError::Handshake(format!(
                            "expected key confirmation, got {:?}",
                            other
                        )))
                    }
                };
                let probe = decryptor
                    .decrypt(&their_sealed)
                    .map_err(|_| ConnectionError::Authentication)?;
                if probe != KEY_CONFIRM_PROBE {
                    return Err(ConnectionError::Authentication);
                }
                (Box::new(encryptor), Box::new(decryptor))
            }
            _ => return Err(ConnectionError::CryptoMismatch),
        };

    Ok(HandshakeOutcome {
        fields,
        encryptor,
        decryptor,
    })
}

/// Build the established connection and spawn its three tasks: control
/// reader, control writer, and the UDP forwarder.
#[allow(clippy::too_many_arguments)]
fn spawn_established(
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    outbound: bool,
    remote_addr: std::net::SocketAddr,
    outcome: HandshakeOutcome,
    params: &HandshakeParams,
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> Arc<Connection> {
    let (tcp_tx, tcp_rx) = mpsc::channel(64);
    let (forward_tx, forward_rx) = mpsc::channel(super::FORWARD_QUEUE_DEPTH);
    let (shutdown_tx, _) = watch::channel(false);

    let conn = Arc::new(Connection {
        id: super::next_connection_id(),
        local_name: params.name,
        remote_name: outcome.fields.name,
        remote_nickname: outcome.fields.nickname,
        remote_addr,
        // Outbound: we dialed their advertised port, UDP goes there too.
        // Inbound: their source port is ephemeral; wait for a heartbeat
        // to learn the real return address.
        udp_addr: Mutex::new(remote_addr),
        outbound,
        udp_ready: AtomicBool::new(outbound),
        heartbeat_seen: AtomicBool::new(false),
        timing: params.timing.clone(),
        state: Mutex::new(ConnectionState::Established),
        effective_pmtu: std::sync::atomic::AtomicU64::new(u64::from(DEFAULT_PMTU)),
        decryptor: Mutex::new(outcome.decryptor),
        last_heartbeat: Mutex::new(Instant::now()),
        tcp_tx,
        forward_tx,
        events: events.clone(),
        shutdown_tx,
    });

    let (pmtu_tx, pmtu_rx) = mpsc::channel(16);

    tokio::spawn(control_reader(conn.clone(), reader, pmtu_tx, events.clone()));
    tokio::spawn(control_writer(conn.clone(), writer, tcp_rx));
    tokio::spawn(forwarder::run(
        conn.clone(),
        udp,
        outcome.encryptor,
        forward_rx,
        pmtu_rx,
    ));

    // The router's event loop registers it (or tie-breaks it away).
    let _ = events.send(ConnEvent::Established(conn.clone()));
    conn
}

/// Reads control messages until the connection dies. Gossip goes up to
/// the router; PMTU verification messages go sideways to the forwarder.
async fn control_reader(
    conn: Arc<Connection>,
    mut reader: BufReader<OwnedReadHalf>,
    pmtu_tx: mpsc::Sender<ControlMsg>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut shutdown = conn.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = read_msg(&mut reader) => match msg {
                Ok(msg @ (ControlMsg::Gossip { .. }
                    | ControlMsg::GossipBroadcast { .. }
                    | ControlMsg::GossipUnicast { .. })) => {
                    let _ = events.send(ConnEvent::Gossip {
                        from: conn.remote_name(),
                        msg,
                    });
                }
                Ok(msg @ (ControlMsg::FragmentationReceived | ControlMsg::PmtuVerified { .. })) => {
                    let _ = pmtu_tx.try_send(msg);
                }
                Ok(ControlMsg::Close { reason }) => {
                    conn.shutdown(&format!("closed by peer: {}", reason));
                    break;
                }
                Ok(other) => {
                    conn.shutdown(&format!("unexpected control message {:?}", other));
                    break;
                }
                Err(e) => {
                    conn.shutdown(&format!("control channel read: {}", e));
                    break;
                }
            },
        }
    }
    // Read half drops here; with the writer gone too the socket closes.
}

/// Drains the control send queue onto the TCP stream.
async fn control_writer(
    conn: Arc<Connection>,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut tcp_rx: mpsc::Receiver<ControlMsg>,
) {
    let mut shutdown = conn.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Courtesy flush: deliver any pending Close before exit.
                while let Ok(msg) = tcp_rx.try_recv() {
                    if matches!(msg, ControlMsg::Close { .. }) {
                        let _ = write_msg(&mut writer, &msg).await;
                    }
                }
                break;
            }
            msg = tcp_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write_msg(&mut writer, &msg).await {
                        conn.shutdown(&format!("control channel write: {}", e));
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
}
