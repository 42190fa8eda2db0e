//! Wire protocol: TCP control messages, UDP frame batching, specials.
//!
//! Two channels exist per connection. The TCP control channel carries
//! length-prefixed tagged messages (handshake, gossip, PMTU verification,
//! explicit close). The UDP data channel carries encrypted payloads of
//! batched Ethernet frame units, prefixed by the 8-byte sender name.
//!
//! ## TCP control message
//!
//! ```text
//! [len:4 BE][tag:1][body...]
//! ```
//!
//! ## UDP datagram
//!
//! ```text
//! [sender PeerName:8][encrypted payload]
//! ```
//!
//! where the decrypted payload is a sequence of frame units:
//!
//! ```text
//! [src PeerName:8][dst PeerName:8][frame_len:2 BE][frame...]
//! ```
//!
//! ## Special frames
//!
//! Heartbeats and PMTU probes travel inside the encrypted UDP channel as
//! pseudo-Ethernet frames (zeroed MACs, experimental EtherType) and are
//! recognised *by exact byte length* after the usual Ethernet decode.
//! Decoding first and branching on length after is deliberate: genuine
//! frames vastly outnumber specials and always need decoding anyway.

use std::fmt;
use thiserror::Error;

use crate::ethernet::ETHERNET_OVERHEAD;
use crate::name::{PeerName, NAME_SIZE};

/// Protocol version spoken on the control channel.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest UDP datagram we will read.
pub const MAX_UDP_PACKET_SIZE: usize = 65536;

/// Largest TCP control message body we will accept.
pub const MAX_TCP_MSG_SIZE: usize = 1 << 22;

/// EtherType marking internally generated special frames (local
/// experimental range, never emitted by real hosts).
pub const ETHERTYPE_SPECIAL: u16 = 0x88b5;

/// Exact length of a heartbeat frame: header plus 8-byte counter.
pub const HEARTBEAT_SIZE: usize = ETHERNET_OVERHEAD + 8;

/// Exact length of the fragmentation test frame. Anything this large that
/// arrives intact proves the path carries large UDP datagrams unfragmented.
pub const FRAG_TEST_SIZE: usize = 8192;

/// Overhead of one frame unit around its frame bytes.
pub const FRAME_UNIT_OVERHEAD: usize = NAME_SIZE * 2 + 2;

/// Errors from decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control message too short: {0} bytes")]
    MsgTooShort(usize),

    #[error("control message too large: {0} bytes")]
    MsgTooLarge(usize),

    #[error("unknown control message tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("truncated {0} message")]
    Truncated(&'static str),

    #[error("frame unit truncated at offset {0}")]
    FrameUnitTruncated(usize),

    #[error("handshake field '{0}' missing")]
    MissingField(&'static str),

    #[error("handshake field '{field}' malformed: {reason}")]
    MalformedField { field: &'static str, reason: String },

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

// ============================================================================
// TCP control messages
// ============================================================================

/// Control message tags (first byte after the length prefix).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolTag {
    /// Identity exchange; first message on every connection.
    Handshake = 0x01,
    /// Encrypted key-confirmation probe, sent after Handshake when a
    /// password is configured.
    KeyConfirm = 0x02,
    /// Periodic full-state gossip for one topic.
    Gossip = 0x03,
    /// Event-driven gossip delta to be propagated onward.
    GossipBroadcast = 0x04,
    /// Point-to-point gossip for one topic.
    GossipUnicast = 0x05,
    /// The fragmentation test frame arrived intact.
    FragmentationReceived = 0x06,
    /// A PMTU probe of the carried size arrived intact.
    PmtuVerified = 0x07,
    /// Deliberate connection close with a reason.
    Close = 0x08,
}

impl ProtocolTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ProtocolTag::Handshake),
            0x02 => Some(ProtocolTag::KeyConfirm),
            0x03 => Some(ProtocolTag::Gossip),
            0x04 => Some(ProtocolTag::GossipBroadcast),
            0x05 => Some(ProtocolTag::GossipUnicast),
            0x06 => Some(ProtocolTag::FragmentationReceived),
            0x07 => Some(ProtocolTag::PmtuVerified),
            0x08 => Some(ProtocolTag::Close),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolTag::Handshake => "Handshake",
            ProtocolTag::KeyConfirm => "KeyConfirm",
            ProtocolTag::Gossip => "Gossip",
            ProtocolTag::GossipBroadcast => "GossipBroadcast",
            ProtocolTag::GossipUnicast => "GossipUnicast",
            ProtocolTag::FragmentationReceived => "FragmentationReceived",
            ProtocolTag::PmtuVerified => "PmtuVerified",
            ProtocolTag::Close => "Close",
        };
        write!(f, "{}", name)
    }
}

/// A decoded control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMsg {
    Handshake(HandshakeFields),
    KeyConfirm(Vec<u8>),
    Gossip { topic: u32, payload: Vec<u8> },
    GossipBroadcast { topic: u32, payload: Vec<u8> },
    GossipUnicast {
        topic: u32,
        src: PeerName,
        payload: Vec<u8>,
    },
    FragmentationReceived,
    PmtuVerified { size: u16 },
    Close { reason: String },
}

impl ControlMsg {
    /// Encode to the body of a length-prefixed message (tag included,
    /// length prefix excluded; the framed writer adds it).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ControlMsg::Handshake(fields) => {
                out.push(ProtocolTag::Handshake.to_byte());
                fields.encode_into(&mut out);
            }
            ControlMsg::KeyConfirm(sealed) => {
                out.push(ProtocolTag::KeyConfirm.to_byte());
                out.extend_from_slice(sealed);
            }
            ControlMsg::Gossip { topic, payload } => {
                out.push(ProtocolTag::Gossip.to_byte());
                out.extend_from_slice(&topic.to_be_bytes());
                out.extend_from_slice(payload);
            }
            ControlMsg::GossipBroadcast { topic, payload } => {
                out.push(ProtocolTag::GossipBroadcast.to_byte());
                out.extend_from_slice(&topic.to_be_bytes());
                out.extend_from_slice(payload);
            }
            ControlMsg::GossipUnicast {
                topic,
                src,
                payload,
            } => {
                out.push(ProtocolTag::GossipUnicast.to_byte());
                out.extend_from_slice(&topic.to_be_bytes());
                out.extend_from_slice(src.as_slice());
                out.extend_from_slice(payload);
            }
            ControlMsg::FragmentationReceived => {
                out.push(ProtocolTag::FragmentationReceived.to_byte());
            }
            ControlMsg::PmtuVerified { size } => {
                out.push(ProtocolTag::PmtuVerified.to_byte());
                out.extend_from_slice(&size.to_be_bytes());
            }
            ControlMsg::Close { reason } => {
                out.push(ProtocolTag::Close.to_byte());
                out.extend_from_slice(reason.as_bytes());
            }
        }
        out
    }

    /// Decode a message body (tag byte first).
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag_byte, rest) = body
            .split_first()
            .ok_or(ProtocolError::MsgTooShort(body.len()))?;
        let tag = ProtocolTag::from_byte(tag_byte).ok_or(ProtocolError::UnknownTag(tag_byte))?;
        match tag {
            ProtocolTag::Handshake => Ok(ControlMsg::Handshake(HandshakeFields::decode(rest)?)),
            ProtocolTag::KeyConfirm => Ok(ControlMsg::KeyConfirm(rest.to_vec())),
            ProtocolTag::Gossip | ProtocolTag::GossipBroadcast => {
                if rest.len() < 4 {
                    return Err(ProtocolError::Truncated("gossip"));
                }
                let topic = u32::from_be_bytes(rest[..4].try_into().expect("topic size"));
                let payload = rest[4..].to_vec();
                if tag == ProtocolTag::Gossip {
                    Ok(ControlMsg::Gossip { topic, payload })
                } else {
                    Ok(ControlMsg::GossipBroadcast { topic, payload })
                }
            }
            ProtocolTag::GossipUnicast => {
                if rest.len() < 4 + NAME_SIZE {
                    return Err(ProtocolError::Truncated("gossip unicast"));
                }
                let topic = u32::from_be_bytes(rest[..4].try_into().expect("topic size"));
                let src = PeerName::from_slice(&rest[4..4 + NAME_SIZE])
                    .expect("length checked above");
                Ok(ControlMsg::GossipUnicast {
                    topic,
                    src,
                    payload: rest[4 + NAME_SIZE..].to_vec(),
                })
            }
            ProtocolTag::FragmentationReceived => Ok(ControlMsg::FragmentationReceived),
            ProtocolTag::PmtuVerified => {
                if rest.len() < 2 {
                    return Err(ProtocolError::Truncated("pmtu verified"));
                }
                Ok(ControlMsg::PmtuVerified {
                    size: u16::from_be_bytes([rest[0], rest[1]]),
                })
            }
            ProtocolTag::Close => Ok(ControlMsg::Close {
                reason: String::from_utf8(rest.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("close reason"))?,
            }),
        }
    }
}

// ============================================================================
// Handshake fields
// ============================================================================

/// Identity and capabilities exchanged in the first control message.
///
/// Encoded as a count-prefixed field map so either side can grow the set
/// without breaking older peers; unknown keys are skipped on decode.
///
/// ```text
/// [n:1] n × { [klen:1][key][vlen:2 BE][value] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeFields {
    pub name: PeerName,
    pub nickname: String,
    pub version: u8,
    /// Ephemeral public key; present iff the sender has a password
    /// configured and expects an encrypted session.
    pub public_key: Option<Vec<u8>>,
}

impl HandshakeFields {
    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut fields: Vec<(&[u8], Vec<u8>)> = vec![
            (b"name", self.name.as_slice().to_vec()),
            (b"nickname", self.nickname.as_bytes().to_vec()),
            (b"version", vec![self.version]),
        ];
        if let Some(pk) = &self.public_key {
            fields.push((b"public_key", pk.clone()));
        }
        out.push(fields.len() as u8);
        for (key, value) in fields {
            out.push(key.len() as u8);
            out.extend_from_slice(key);
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(&value);
        }
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&count, mut rest) = body
            .split_first()
            .ok_or(ProtocolError::Truncated("handshake"))?;
        let mut name = None;
        let mut nickname = None;
        let mut version = None;
        let mut public_key = None;
        for _ in 0..count {
            let (&klen, after) = rest
                .split_first()
                .ok_or(ProtocolError::Truncated("handshake field"))?;
            let klen = klen as usize;
            if after.len() < klen + 2 {
                return Err(ProtocolError::Truncated("handshake field"));
            }
            let key = &after[..klen];
            let vlen = u16::from_be_bytes([after[klen], after[klen + 1]]) as usize;
            if after.len() < klen + 2 + vlen {
                return Err(ProtocolError::Truncated("handshake field"));
            }
            let value = &after[klen + 2..klen + 2 + vlen];
            rest = &after[klen + 2 + vlen..];
            match key {
                b"name" => {
                    name = Some(PeerName::from_slice(value).map_err(|e| {
                        ProtocolError::MalformedField {
                            field: "name",
                            reason: e.to_string(),
                        }
                    })?)
                }
                b"nickname" => {
                    nickname = Some(String::from_utf8(value.to_vec()).map_err(|_| {
                        ProtocolError::InvalidUtf8("nickname")
                    })?)
                }
                b"version" => {
                    version = Some(*value.first().ok_or(ProtocolError::MalformedField {
                        field: "version",
                        reason: "empty".to_string(),
                    })?)
                }
                b"public_key" => public_key = Some(value.to_vec()),
                // Unknown field from a newer peer
                _ => {}
            }
        }
        Ok(Self {
            name: name.ok_or(ProtocolError::MissingField("name"))?,
            nickname: nickname.ok_or(ProtocolError::MissingField("nickname"))?,
            version: version.ok_or(ProtocolError::MissingField("version"))?,
            public_key,
        })
    }
}

// ============================================================================
// UDP frame units
// ============================================================================

/// Append one frame unit to an outgoing payload.
pub fn encode_frame_unit(out: &mut Vec<u8>, src: PeerName, dst: PeerName, frame: &[u8]) {
    out.extend_from_slice(src.as_slice());
    out.extend_from_slice(dst.as_slice());
    out.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    out.extend_from_slice(frame);
}

/// Iterate the frame units of a decrypted payload.
pub struct FrameUnitIter<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> FrameUnitIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }
}

impl<'a> Iterator for FrameUnitIter<'a> {
    type Item = Result<(PeerName, PeerName, &'a [u8]), ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.payload.len() {
            return None;
        }
        let at = self.pos;
        let rest = &self.payload[self.pos..];
        if rest.len() < FRAME_UNIT_OVERHEAD {
            self.pos = self.payload.len();
            return Some(Err(ProtocolError::FrameUnitTruncated(at)));
        }
        let src = PeerName::from_slice(&rest[..NAME_SIZE]).expect("length checked");
        let dst = PeerName::from_slice(&rest[NAME_SIZE..NAME_SIZE * 2]).expect("length checked");
        let frame_len =
            u16::from_be_bytes([rest[NAME_SIZE * 2], rest[NAME_SIZE * 2 + 1]]) as usize;
        if rest.len() < FRAME_UNIT_OVERHEAD + frame_len {
            self.pos = self.payload.len();
            return Some(Err(ProtocolError::FrameUnitTruncated(at)));
        }
        let frame = &rest[FRAME_UNIT_OVERHEAD..FRAME_UNIT_OVERHEAD + frame_len];
        self.pos += FRAME_UNIT_OVERHEAD + frame_len;
        Some(Ok((src, dst, frame)))
    }
}

// ============================================================================
// Special frames
// ============================================================================

/// Classification of a special (internally generated) frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialFrame {
    /// Liveness signal with a monotone counter.
    Heartbeat(u64),
    /// Fragmentation test frame arrived whole.
    FragTest,
    /// PMTU probe; the embedded size is what survived the path.
    PmtuProbe(u16),
}

/// Whether a decoded frame is one of ours rather than captured traffic.
pub fn is_special(frame: &[u8]) -> bool {
    frame.len() >= ETHERNET_OVERHEAD
        && frame[..12].iter().all(|&b| b == 0)
        && u16::from_be_bytes([frame[12], frame[13]]) == ETHERTYPE_SPECIAL
}

/// Classify a special frame by its exact length.
pub fn classify_special(frame: &[u8]) -> Option<SpecialFrame> {
    if !is_special(frame) {
        return None;
    }
    match frame.len() {
        HEARTBEAT_SIZE => {
            let counter = u64::from_be_bytes(
                frame[ETHERNET_OVERHEAD..].try_into().expect("heartbeat size"),
            );
            Some(SpecialFrame::Heartbeat(counter))
        }
        FRAG_TEST_SIZE => Some(SpecialFrame::FragTest),
        len => Some(SpecialFrame::PmtuProbe((len - ETHERNET_OVERHEAD) as u16)),
    }
}

fn special_header() -> [u8; ETHERNET_OVERHEAD] {
    let mut header = [0u8; ETHERNET_OVERHEAD];
    header[12..14].copy_from_slice(&ETHERTYPE_SPECIAL.to_be_bytes());
    header
}

/// Build a heartbeat frame.
pub fn make_heartbeat(counter: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEARTBEAT_SIZE);
    frame.extend_from_slice(&special_header());
    frame.extend_from_slice(&counter.to_be_bytes());
    frame
}

/// Build the fragmentation test frame.
pub fn make_frag_test() -> Vec<u8> {
    let mut frame = vec![0u8; FRAG_TEST_SIZE];
    frame[..ETHERNET_OVERHEAD].copy_from_slice(&special_header());
    frame
}

/// Build a PMTU probe whose payload pads the frame to `size` bytes past
/// the Ethernet header.
pub fn make_pmtu_probe(size: u16) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_OVERHEAD + size as usize];
    frame[..ETHERNET_OVERHEAD].copy_from_slice(&special_header());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(b: u8) -> PeerName {
        PeerName::from_bytes([b, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_control_msg_roundtrip() {
        let msgs = vec![
            ControlMsg::Handshake(HandshakeFields {
                name: name(7),
                nickname: "host-a".to_string(),
                version: PROTOCOL_VERSION,
                public_key: Some(vec![3u8; 33]),
            }),
            ControlMsg::KeyConfirm(vec![1, 2, 3]),
            ControlMsg::Gossip {
                topic: 42,
                payload: vec![9, 9],
            },
            ControlMsg::GossipBroadcast {
                topic: 42,
                payload: vec![],
            },
            ControlMsg::GossipUnicast {
                topic: 1,
                src: name(3),
                payload: vec![5],
            },
            ControlMsg::FragmentationReceived,
            ControlMsg::PmtuVerified { size: 1438 },
            ControlMsg::Close {
                reason: "shutting down".to_string(),
            },
        ];
        for msg in msgs {
            let decoded = ControlMsg::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_handshake_without_key() {
        let msg = ControlMsg::Handshake(HandshakeFields {
            name: name(1),
            nickname: "n".to_string(),
            version: 1,
            public_key: None,
        });
        match ControlMsg::decode(&msg.encode()).unwrap() {
            ControlMsg::Handshake(f) => assert!(f.public_key.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(matches!(
            ControlMsg::decode(&[0xee, 1, 2]),
            Err(ProtocolError::UnknownTag(0xee))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let msg = ControlMsg::Handshake(HandshakeFields {
            name: name(1),
            nickname: "nick".to_string(),
            version: 1,
            public_key: None,
        });
        let mut body = msg.encode();
        body.truncate(body.len() - 3);
        assert!(ControlMsg::decode(&body).is_err());
    }

    #[test]
    fn test_frame_unit_iteration() {
        let mut payload = Vec::new();
        encode_frame_unit(&mut payload, name(1), name(2), &[0xaa; 60]);
        encode_frame_unit(&mut payload, name(3), name(4), &[0xbb; 20]);
        let units: Vec<_> = FrameUnitIter::new(&payload)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, name(1));
        assert_eq!(units[0].2.len(), 60);
        assert_eq!(units[1].1, name(4));
    }

    #[test]
    fn test_frame_unit_truncation_detected() {
        let mut payload = Vec::new();
        encode_frame_unit(&mut payload, name(1), name(2), &[0xaa; 60]);
        payload.truncate(payload.len() - 1);
        let results: Vec<_> = FrameUnitIter::new(&payload).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ProtocolError::FrameUnitTruncated(0))
        ));
    }

    #[test]
    fn test_frame_unit_truncation_reports_unit_offset() {
        let mut payload = Vec::new();
        encode_frame_unit(&mut payload, name(1), name(2), &[0xaa; 60]);
        let second_at = payload.len();
        encode_frame_unit(&mut payload, name(3), name(4), &[0xbb; 20]);
        payload.truncate(payload.len() - 1);
        let results: Vec<_> = FrameUnitIter::new(&payload).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        // The error points at the start of the bad unit, not the
        // payload end.
        match &results[1] {
            Err(ProtocolError::FrameUnitTruncated(at)) => assert_eq!(*at, second_at),
            other => panic!("expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn test_specials_classified_by_length() {
        assert_eq!(
            classify_special(&make_heartbeat(77)),
            Some(SpecialFrame::Heartbeat(77))
        );
        assert_eq!(classify_special(&make_frag_test()), Some(SpecialFrame::FragTest));
        assert_eq!(
            classify_special(&make_pmtu_probe(1400)),
            Some(SpecialFrame::PmtuProbe(1400))
        );
    }

    #[test]
    fn test_real_frames_are_not_special() {
        let frame = crate::ethernet::tests::make_ipv4_frame(false, 8);
        assert!(!is_special(&frame));
        assert!(classify_special(&frame).is_none());
    }
}
