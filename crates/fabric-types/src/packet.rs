//! Probe frame and its wire codec.
//!
//! A probe is an Ethernet frame with an 802.1Q header, an IPv4 header and a
//! TCP header followed by a short payload. The trace color rides in the PCP
//! bits of the 802.1Q header; every other field is preserved as the probe is
//! intercepted and re-emitted hop by hop.

use crate::{Color, MacAddress, VlanId, MAX_COLOR, UNTAGGED};
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;

const ETH_HEADER_LEN: usize = 14;
const VLAN_HEADER_LEN: usize = 4;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_TCP: u8 = 6;

const PCP_SHIFT: u16 = 13;
const VID_MASK: u16 = 0x0fff;

/// Errors raised while encoding or decoding probe frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported ethertype 0x{0:04x}")]
    UnsupportedEtherType(u16),

    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("tag {0} does not fit the {bits}-bit tag field", bits = crate::TAG_BITS)]
    InvalidTag(u8),

    #[error("cannot set tag {0} on a frame without an 802.1Q header")]
    NotTagged(u8),

    #[error("payload of {0} bytes does not fit an IPv4 packet")]
    PayloadTooLarge(usize),
}

/// A TCP/IPv4 probe frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    pub eth_src: MacAddress,
    pub eth_dst: MacAddress,
    /// `None` for a frame without an 802.1Q header.
    pub vlan: Option<VlanId>,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ttl: u8,
    pub tcp_src_port: u16,
    pub tcp_dst_port: u16,
    pub payload: Vec<u8>,
    tag: u8,
}

impl ProbePacket {
    pub const DEFAULT_TTL: u8 = 128;

    /// Creates an uncolored probe with zeroed addresses and a one-byte payload.
    pub fn new(eth_src: MacAddress, eth_dst: MacAddress, vlan: Option<VlanId>) -> Self {
        ProbePacket {
            eth_src,
            eth_dst,
            vlan,
            ip_src: Ipv4Addr::UNSPECIFIED,
            ip_dst: Ipv4Addr::UNSPECIFIED,
            ttl: Self::DEFAULT_TTL,
            tcp_src_port: 0,
            tcp_dst_port: 0,
            payload: vec![0x01],
            tag: UNTAGGED,
        }
    }

    /// True when the frame carries an 802.1Q header.
    pub fn is_tagged(&self) -> bool {
        self.vlan.is_some()
    }

    /// Raw value of the tag field. Frames without an 802.1Q header read 0.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// The color carried in the tag field, if any.
    pub fn color(&self) -> Option<Color> {
        Color::from_tag(self.tag)
    }

    /// Writes a raw tag value. Writing 0 makes the probe uncolored.
    pub fn set_tag(&mut self, tag: u8) -> Result<(), PacketError> {
        if tag > MAX_COLOR {
            return Err(PacketError::InvalidTag(tag));
        }
        if self.vlan.is_none() && tag != UNTAGGED {
            return Err(PacketError::NotTagged(tag));
        }
        self.tag = tag;
        Ok(())
    }

    /// Copy of this probe carrying `color`.
    pub fn with_color(&self, color: Color) -> Result<Self, PacketError> {
        let mut colored = self.clone();
        colored.set_tag(color.get())?;
        Ok(colored)
    }

    /// Total encoded length in bytes.
    pub fn wire_len(&self) -> usize {
        let vlan = if self.vlan.is_some() { VLAN_HEADER_LEN } else { 0 };
        ETH_HEADER_LEN + vlan + IPV4_HEADER_LEN + TCP_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let ip_total = IPV4_HEADER_LEN + TCP_HEADER_LEN + self.payload.len();
        let ip_total_u16 =
            u16::try_from(ip_total).map_err(|_| PacketError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = vec![0u8; self.wire_len()];
        buf[0..6].copy_from_slice(self.eth_dst.as_bytes());
        buf[6..12].copy_from_slice(self.eth_src.as_bytes());
        let mut offset = 12;
        if let Some(vlan) = self.vlan {
            BigEndian::write_u16(&mut buf[offset..], ETHERTYPE_VLAN);
            let tci = (u16::from(self.tag) << PCP_SHIFT) | vlan.as_u16();
            BigEndian::write_u16(&mut buf[offset + 2..], tci);
            offset += VLAN_HEADER_LEN;
        }
        BigEndian::write_u16(&mut buf[offset..], ETHERTYPE_IPV4);
        offset += 2;

        let ip = offset;
        buf[ip] = 0x45;
        BigEndian::write_u16(&mut buf[ip + 2..], ip_total_u16);
        buf[ip + 8] = self.ttl;
        buf[ip + 9] = IP_PROTO_TCP;
        buf[ip + 12..ip + 16].copy_from_slice(&self.ip_src.octets());
        buf[ip + 16..ip + 20].copy_from_slice(&self.ip_dst.octets());
        let ip_sum = checksum(0, &buf[ip..ip + IPV4_HEADER_LEN]);
        BigEndian::write_u16(&mut buf[ip + 10..], ip_sum);

        let tcp = ip + IPV4_HEADER_LEN;
        BigEndian::write_u16(&mut buf[tcp..], self.tcp_src_port);
        BigEndian::write_u16(&mut buf[tcp + 2..], self.tcp_dst_port);
        buf[tcp + 12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
        buf[tcp + TCP_HEADER_LEN..].copy_from_slice(&self.payload);

        let tcp_len = TCP_HEADER_LEN + self.payload.len();
        let tcp_sum = checksum(self.pseudo_header_sum(tcp_len), &buf[tcp..]);
        BigEndian::write_u16(&mut buf[tcp + 16..], tcp_sum);

        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, PacketError> {
        ensure_len(frame, ETH_HEADER_LEN)?;
        let eth_dst = mac_at(frame, 0);
        let eth_src = mac_at(frame, 6);
        let mut ethertype = BigEndian::read_u16(&frame[12..]);
        let mut offset = ETH_HEADER_LEN;

        let mut vlan = None;
        let mut tag = UNTAGGED;
        if ethertype == ETHERTYPE_VLAN {
            ensure_len(frame, offset + VLAN_HEADER_LEN)?;
            let tci = BigEndian::read_u16(&frame[offset..]);
            tag = (tci >> PCP_SHIFT) as u8;
            vlan = Some(
                VlanId::new(tci & VID_MASK).map_err(|_| PacketError::Malformed("reserved VLAN id"))?,
            );
            ethertype = BigEndian::read_u16(&frame[offset + 2..]);
            offset += VLAN_HEADER_LEN;
        }
        if ethertype != ETHERTYPE_IPV4 {
            return Err(PacketError::UnsupportedEtherType(ethertype));
        }

        let ip = offset;
        ensure_len(frame, ip + IPV4_HEADER_LEN)?;
        if frame[ip] >> 4 != 4 {
            return Err(PacketError::Malformed("not an IPv4 header"));
        }
        let ihl = usize::from(frame[ip] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN {
            return Err(PacketError::Malformed("IPv4 header length below minimum"));
        }
        let ip_total = usize::from(BigEndian::read_u16(&frame[ip + 2..]));
        ensure_len(frame, ip + ip_total)?;
        let protocol = frame[ip + 9];
        if protocol != IP_PROTO_TCP {
            return Err(PacketError::UnsupportedProtocol(protocol));
        }
        let ttl = frame[ip + 8];
        let ip_src = ipv4_at(frame, ip + 12);
        let ip_dst = ipv4_at(frame, ip + 16);

        let tcp = ip + ihl;
        if ip_total < ihl + TCP_HEADER_LEN {
            return Err(PacketError::Malformed("IPv4 total length too short for TCP"));
        }
        let data_offset = usize::from(frame[tcp + 12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN || ihl + data_offset > ip_total {
            return Err(PacketError::Malformed("bad TCP data offset"));
        }
        let tcp_src_port = BigEndian::read_u16(&frame[tcp..]);
        let tcp_dst_port = BigEndian::read_u16(&frame[tcp + 2..]);
        let payload = frame[tcp + data_offset..ip + ip_total].to_vec();

        Ok(ProbePacket {
            eth_src,
            eth_dst,
            vlan,
            ip_src,
            ip_dst,
            ttl,
            tcp_src_port,
            tcp_dst_port,
            payload,
            tag,
        })
    }

    fn pseudo_header_sum(&self, tcp_len: usize) -> u32 {
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&self.ip_src.octets());
        pseudo[4..8].copy_from_slice(&self.ip_dst.octets());
        pseudo[9] = IP_PROTO_TCP;
        // Callers have already bounded tcp_len by the IPv4 total length.
        BigEndian::write_u16(&mut pseudo[10..], tcp_len as u16);
        sum_words(0, &pseudo)
    }
}

/// Reads the tag field of a raw frame without decoding the rest.
///
/// Returns `None` for frames without an 802.1Q header.
pub fn peek_tag(frame: &[u8]) -> Option<u8> {
    if frame.len() < ETH_HEADER_LEN + VLAN_HEADER_LEN
        || BigEndian::read_u16(&frame[12..]) != ETHERTYPE_VLAN
    {
        return None;
    }
    Some((BigEndian::read_u16(&frame[14..]) >> PCP_SHIFT) as u8)
}

/// Reads the destination MAC of a raw frame.
pub fn peek_eth_dst(frame: &[u8]) -> Option<MacAddress> {
    (frame.len() >= ETH_HEADER_LEN).then(|| mac_at(frame, 0))
}

fn ensure_len(frame: &[u8], needed: usize) -> Result<(), PacketError> {
    if frame.len() < needed {
        Err(PacketError::Truncated {
            needed,
            available: frame.len(),
        })
    } else {
        Ok(())
    }
}

fn mac_at(frame: &[u8], offset: usize) -> MacAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&frame[offset..offset + 6]);
    MacAddress::new(bytes)
}

fn ipv4_at(frame: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    )
}

fn sum_words(initial: u32, data: &[u8]) -> u32 {
    let mut sum = initial;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(BigEndian::read_u16(word));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Internet checksum over `data`, seeded with a partial sum.
fn checksum(initial: u32, data: &[u8]) -> u16 {
    let mut sum = sum_words(initial, data);
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ProbePacket {
        let mut probe = ProbePacket::new(
            MacAddress::from_u64(1),
            MacAddress::from_u64(2),
            Some(VlanId::new(10).unwrap()),
        );
        probe.ip_src = Ipv4Addr::new(10, 0, 0, 1);
        probe.ip_dst = Ipv4Addr::new(10, 0, 0, 2);
        probe.tcp_src_port = 4000;
        probe.tcp_dst_port = 80;
        probe
    }

    #[test]
    fn test_encode_layout() {
        let frame = sample().with_color(Color::new(5).unwrap()).unwrap().encode().unwrap();
        assert_eq!(frame.len(), 14 + 4 + 20 + 20 + 1);
        assert_eq!(&frame[12..14], &[0x81, 0x00]);
        // PCP 5, VID 10
        assert_eq!(BigEndian::read_u16(&frame[14..]), (5 << 13) | 10);
        assert_eq!(&frame[16..18], &[0x08, 0x00]);
        assert_eq!(frame[18 + 8], 128);
        assert_eq!(*frame.last().unwrap(), 0x01);
    }

    #[test]
    fn test_ip_checksum_verifies() {
        let frame = sample().encode().unwrap();
        // Summing a header that includes its own checksum yields zero.
        assert_eq!(checksum(0, &frame[18..38]), 0);
    }

    #[test]
    fn test_tag_survives_every_value() {
        for tag in 0..=MAX_COLOR {
            let mut probe = sample();
            probe.set_tag(tag).unwrap();
            let decoded = ProbePacket::decode(&probe.encode().unwrap()).unwrap();
            assert_eq!(decoded.tag(), tag);
            assert_eq!(decoded, probe);
        }
    }

    #[test]
    fn test_zero_tag_reads_as_uncolored() {
        let mut probe = sample();
        probe.set_tag(0).unwrap();
        assert_eq!(probe.color(), None);

        let untagged = ProbePacket::new(MacAddress::from_u64(1), MacAddress::from_u64(2), None);
        let decoded = ProbePacket::decode(&untagged.encode().unwrap()).unwrap();
        assert_eq!(decoded.color(), None);
        assert_eq!(decoded.tag(), UNTAGGED);
        assert_eq!(peek_tag(&untagged.encode().unwrap()), None);
    }

    #[test]
    fn test_set_tag_bounds() {
        let mut probe = sample();
        assert_eq!(probe.set_tag(8), Err(PacketError::InvalidTag(8)));

        let mut untagged = ProbePacket::new(MacAddress::ZERO, MacAddress::ZERO, None);
        assert_eq!(untagged.set_tag(3), Err(PacketError::NotTagged(3)));
        assert!(untagged.set_tag(0).is_ok());
    }

    #[test]
    fn test_peek_helpers() {
        let frame = sample().with_color(Color::new(3).unwrap()).unwrap().encode().unwrap();
        assert_eq!(peek_tag(&frame), Some(3));
        assert_eq!(peek_eth_dst(&frame), Some(MacAddress::from_u64(2)));
        assert_eq!(peek_eth_dst(&frame[..4]), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ProbePacket::decode(&[0u8; 6]),
            Err(PacketError::Truncated { needed: 14, available: 6 })
        ));

        let mut frame = sample().encode().unwrap();
        frame[16] = 0x86;
        frame[17] = 0xdd;
        assert_eq!(
            ProbePacket::decode(&frame),
            Err(PacketError::UnsupportedEtherType(0x86dd))
        );

        let mut frame = sample().encode().unwrap();
        frame[18 + 9] = 17;
        assert_eq!(ProbePacket::decode(&frame), Err(PacketError::UnsupportedProtocol(17)));

        let frame = sample().encode().unwrap();
        assert!(matches!(
            ProbePacket::decode(&frame[..frame.len() - 1]),
            Err(PacketError::Truncated { .. })
        ));
    }
}
