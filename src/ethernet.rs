//! Ethernet frame decoding and IPv4 helpers.
//!
//! The forwarding path decodes captured frames only as deep as it needs:
//! the Ethernet header always, the IPv4 header when the EtherType says one
//! is present. That is enough to learn MACs, read the Don't-Fragment flag,
//! filter administrative control traffic, and synthesise ICMP
//! "fragmentation needed" errors for oversize DF frames.
//!
//! ## Frame layout
//!
//! ```text
//! [dst MAC:6][src MAC:6][EtherType:2][payload...]
//! ```

use std::fmt;
use std::net::Ipv4Addr;

/// Ethernet header size (dst + src + EtherType).
pub const ETHERNET_OVERHEAD: usize = 14;

/// Minimum IPv4 header size.
pub const IPV4_HEADER_MIN: usize = 20;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for 802.1X port authentication (EAPOL). Never forwarded.
pub const ETHERTYPE_EAPOL: u16 = 0x888e;

/// EtherType for LLDP. Link-local by definition, never forwarded.
pub const ETHERTYPE_LLDP: u16 = 0x88cc;

/// IPv4 Don't-Fragment flag bit (in the flags/fragment-offset word).
const IPV4_FLAG_DF: u16 = 0x4000;

/// IPv4 More-Fragments flag bit.
const IPV4_FLAG_MF: u16 = 0x2000;

/// IP protocol number for ICMP.
const IPPROTO_ICMP: u8 = 1;

/// 6-byte hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from a 6-byte array.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Create from a slice; returns None unless exactly 6 bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Group bit: set for broadcast and multicast destinations.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// STP/BPDU and other 802.1D link-constrained multicast range
    /// (01:80:c2:00:00:00 .. 01:80:c2:00:00:0f). Must not cross bridges.
    pub fn is_bridge_group(&self) -> bool {
        self.0[..5] == [0x01, 0x80, 0xc2, 0x00, 0x00] && self.0[5] <= 0x0f
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// Decoded IPv4 header fields the router cares about.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Info {
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    /// Don't-Fragment flag.
    pub dont_fragment: bool,
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
}

/// Result of decoding a frame.
///
/// `ipv4` is present only when the frame carried a well-formed IPv4 packet;
/// a frame with a mangled IP header still decodes at the Ethernet layer.
#[derive(Clone, Copy, Debug)]
pub struct DecodedFrame {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: u16,
    pub ipv4: Option<Ipv4Info>,
}

impl DecodedFrame {
    /// Decode the Ethernet header and, when present, the IPv4 header.
    /// Returns None for frames too short to carry an Ethernet header.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETHERNET_OVERHEAD {
            return None;
        }
        let dst_mac = MacAddr::from_slice(&frame[0..6])?;
        let src_mac = MacAddr::from_slice(&frame[6..12])?;
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let ipv4 = if ethertype == ETHERTYPE_IPV4 {
            decode_ipv4(&frame[ETHERNET_OVERHEAD..])
        } else {
            None
        };
        Some(Self {
            src_mac,
            dst_mac,
            ethertype,
            ipv4,
        })
    }

    /// Administrative filter: frames that must never cross the overlay.
    ///
    /// Port-authentication and link-discovery traffic is meaningful only on
    /// the physical segment it was captured from, and bridged STP frames
    /// would collapse remote spanning trees into one.
    pub fn drop_frame(&self) -> bool {
        self.ethertype == ETHERTYPE_EAPOL
            || self.ethertype == ETHERTYPE_LLDP
            || self.dst_mac.is_bridge_group()
    }

    /// Don't-Fragment flag of the embedded IPv4 packet, false for non-IP.
    pub fn dont_fragment(&self) -> bool {
        self.ipv4.map(|ip| ip.dont_fragment).unwrap_or(false)
    }
}

fn decode_ipv4(packet: &[u8]) -> Option<Ipv4Info> {
    if packet.len() < IPV4_HEADER_MIN {
        return None;
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return None;
    }
    let header_len = ((packet[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_HEADER_MIN || packet.len() < header_len {
        return None;
    }
    let flags_frag = u16::from_be_bytes([packet[6], packet[7]]);
    Some(Ipv4Info {
        header_len,
        dont_fragment: flags_frag & IPV4_FLAG_DF != 0,
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
    })
}

/// RFC 1071 ones-complement checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u32::from(last) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an ICMP "fragmentation needed" (type 3, code 4) frame in response
/// to an oversize DF frame, advertising `mtu` as the next-hop MTU.
///
/// The reply swaps the original frame's MACs and IP addresses so it travels
/// back toward the sender, and quotes the original IP header plus 8 payload
/// bytes as RFC 792 requires. Returns None when the original frame has no
/// decodable IPv4 header to quote.
pub fn icmp_frag_needed(original: &[u8], mtu: u16) -> Option<Vec<u8>> {
    let dec = DecodedFrame::decode(original)?;
    let ip = dec.ipv4?;
    let ip_packet = &original[ETHERNET_OVERHEAD..];
    let quote_len = (ip.header_len + 8).min(ip_packet.len());
    let quote = &ip_packet[..quote_len];

    // ICMP: type, code, checksum, unused(2), next-hop MTU, quoted packet
    let mut icmp = Vec::with_capacity(8 + quote.len());
    icmp.extend_from_slice(&[3, 4, 0, 0, 0, 0]);
    icmp.extend_from_slice(&mtu.to_be_bytes());
    icmp.extend_from_slice(quote);
    let icmp_sum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&icmp_sum.to_be_bytes());

    // IPv4 header, no options, addresses reversed
    let total_len = (IPV4_HEADER_MIN + icmp.len()) as u16;
    let mut ipv4 = [0u8; IPV4_HEADER_MIN];
    ipv4[0] = 0x45;
    ipv4[2..4].copy_from_slice(&total_len.to_be_bytes());
    ipv4[8] = 64; // TTL
    ipv4[9] = IPPROTO_ICMP;
    ipv4[12..16].copy_from_slice(&ip.dst.octets());
    ipv4[16..20].copy_from_slice(&ip.src.octets());
    let ip_sum = checksum(&ipv4);
    ipv4[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let mut frame = Vec::with_capacity(ETHERNET_OVERHEAD + ipv4.len() + icmp.len());
    frame.extend_from_slice(dec.src_mac.as_bytes()); // back to original sender
    frame.extend_from_slice(dec.dst_mac.as_bytes());
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    frame.extend_from_slice(&ipv4);
    frame.extend_from_slice(&icmp);
    Some(frame)
}

/// Fragment an oversize non-DF IPv4 frame so each fragment fits in `mtu`
/// bytes of frame (Ethernet header included).
///
/// Non-IPv4 frames cannot be fragmented; the caller gets the frame back
/// unchanged and must drop or truncate it. Fragment payload sizes are
/// rounded down to a multiple of 8 as the offset field demands.
pub fn fragment_ipv4(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let dec = match DecodedFrame::decode(frame) {
        Some(d) => d,
        None => return vec![frame.to_vec()],
    };
    let ip = match dec.ipv4 {
        Some(ip) if !ip.dont_fragment => ip,
        _ => return vec![frame.to_vec()],
    };
    if frame.len() <= mtu {
        return vec![frame.to_vec()];
    }

    let eth_header = &frame[..ETHERNET_OVERHEAD];
    let ip_header = &frame[ETHERNET_OVERHEAD..ETHERNET_OVERHEAD + ip.header_len];
    let payload = &frame[ETHERNET_OVERHEAD + ip.header_len..];

    let max_payload = (mtu - ETHERNET_OVERHEAD - ip.header_len) & !7;
    if max_payload == 0 {
        return vec![frame.to_vec()];
    }

    let orig_flags_frag = u16::from_be_bytes([ip_header[6], ip_header[7]]);
    let orig_offset = orig_flags_frag & 0x1fff;
    let orig_mf = orig_flags_frag & IPV4_FLAG_MF != 0;

    let mut fragments = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let chunk = &payload[pos..(pos + max_payload).min(payload.len())];
        let last = pos + chunk.len() == payload.len();

        let mut header: Vec<u8> = ip_header.to_vec();
        let total_len = (ip.header_len + chunk.len()) as u16;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        let offset = orig_offset + (pos / 8) as u16;
        let mut flags_frag = offset;
        if !last || orig_mf {
            flags_frag |= IPV4_FLAG_MF;
        }
        header[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        header[10..12].copy_from_slice(&[0, 0]);
        let sum = checksum(&header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        let mut fragment = Vec::with_capacity(ETHERNET_OVERHEAD + header.len() + chunk.len());
        fragment.extend_from_slice(eth_header);
        fragment.extend_from_slice(&header);
        fragment.extend_from_slice(chunk);
        fragments.push(fragment);

        pos += chunk.len();
    }
    fragments
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an Ethernet+IPv4 frame with the given payload length.
    pub(crate) fn make_ipv4_frame(df: bool, payload_len: usize) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xbb]); // dst
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xaa]); // src
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ipv4 = [0u8; IPV4_HEADER_MIN];
        ipv4[0] = 0x45;
        let total = (IPV4_HEADER_MIN + payload_len) as u16;
        ipv4[2..4].copy_from_slice(&total.to_be_bytes());
        if df {
            ipv4[6] = 0x40;
        }
        ipv4[8] = 64;
        ipv4[9] = 17; // UDP
        ipv4[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ipv4[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let sum = checksum(&ipv4);
        ipv4[10..12].copy_from_slice(&sum.to_be_bytes());
        frame.extend_from_slice(&ipv4);
        frame.extend(std::iter::repeat(0xabu8).take(payload_len));
        frame
    }

    #[test]
    fn test_decode_ipv4_frame() {
        let frame = make_ipv4_frame(true, 100);
        let dec = DecodedFrame::decode(&frame).unwrap();
        assert_eq!(dec.ethertype, ETHERTYPE_IPV4);
        assert!(dec.dont_fragment());
        let ip = dec.ipv4.unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.dst, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(DecodedFrame::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_ip_decode_tolerates_truncated_header() {
        let mut frame = make_ipv4_frame(false, 0);
        frame.truncate(ETHERNET_OVERHEAD + 8);
        let dec = DecodedFrame::decode(&frame).unwrap();
        assert!(dec.ipv4.is_none());
    }

    #[test]
    fn test_drop_filter() {
        let mut frame = make_ipv4_frame(false, 0);
        assert!(!DecodedFrame::decode(&frame).unwrap().drop_frame());
        frame[12..14].copy_from_slice(&ETHERTYPE_EAPOL.to_be_bytes());
        assert!(DecodedFrame::decode(&frame).unwrap().drop_frame());

        let mut stp = make_ipv4_frame(false, 0);
        stp[0..6].copy_from_slice(&[0x01, 0x80, 0xc2, 0x00, 0x00, 0x00]);
        assert!(DecodedFrame::decode(&stp).unwrap().drop_frame());
    }

    #[test]
    fn test_icmp_frag_needed_reverses_path() {
        let frame = make_ipv4_frame(true, 1400);
        let reply = icmp_frag_needed(&frame, 1000).unwrap();
        let dec = DecodedFrame::decode(&reply).unwrap();
        // Reply travels back toward the original source
        assert_eq!(dec.dst_mac.as_bytes(), &[0x02, 0, 0, 0, 0, 0xaa]);
        let ip = dec.ipv4.unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.dst, Ipv4Addr::new(10, 0, 0, 1));
        // ICMP type 3 code 4, advertised MTU
        let icmp = &reply[ETHERNET_OVERHEAD + IPV4_HEADER_MIN..];
        assert_eq!(icmp[0], 3);
        assert_eq!(icmp[1], 4);
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 1000);
    }

    #[test]
    fn test_icmp_frag_needed_requires_ipv4() {
        let mut frame = make_ipv4_frame(true, 100);
        frame[12..14].copy_from_slice(&[0x86, 0xdd]); // IPv6
        assert!(icmp_frag_needed(&frame, 1000).is_none());
    }

    #[test]
    fn test_fragment_ipv4_splits_and_preserves_bytes() {
        let frame = make_ipv4_frame(false, 3000);
        let fragments = fragment_ipv4(&frame, 1000);
        assert!(fragments.len() >= 3);
        for f in &fragments {
            assert!(f.len() <= 1000);
        }
        // Reassemble payloads and compare
        let mut payload = Vec::new();
        for f in &fragments {
            payload.extend_from_slice(&f[ETHERNET_OVERHEAD + IPV4_HEADER_MIN..]);
        }
        assert_eq!(payload, frame[ETHERNET_OVERHEAD + IPV4_HEADER_MIN..]);
        // Last fragment clears MF, others set it
        for (i, f) in fragments.iter().enumerate() {
            let flags = u16::from_be_bytes([f[ETHERNET_OVERHEAD + 6], f[ETHERNET_OVERHEAD + 7]]);
            if i + 1 == fragments.len() {
                assert_eq!(flags & 0x2000, 0);
            } else {
                assert_ne!(flags & 0x2000, 0);
            }
        }
    }

    #[test]
    fn test_fragment_ipv4_leaves_df_frames_alone() {
        let frame = make_ipv4_frame(true, 3000);
        let fragments = fragment_ipv4(&frame, 1000);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0], frame);
    }

    #[test]
    fn test_fragment_small_frame_passthrough() {
        let frame = make_ipv4_frame(false, 100);
        let fragments = fragment_ipv4(&frame, 1500);
        assert_eq!(fragments.len(), 1);
    }
}
