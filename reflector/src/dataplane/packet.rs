//! Zero-copy header cursor.
//!
//! [`PacketView`] walks the header stack of one frame and hands out smoltcp
//! wire views of each header. It only stores byte offsets into the buffer;
//! every accessor re-checks EtherType / next protocol and bounds before
//! building the view, so an absent or malformed header simply yields `None`.
//! L4 views span the whole segment up to the end of the IP datagram, never
//! Ethernet padding.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Range;

use smoltcp::wire::{
    ArpPacket, EthernetAddress, EthernetFrame, EthernetProtocol, Icmpv4Packet, Icmpv6Packet,
    IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};

use super::buffer::PacketBuffer;
use super::vxlan::{VXLAN_HDR_LEN, VxlanHeader};

const ETHER_HDR_LEN: usize = 14;
const ARP_LEN: usize = 28;
const IPV4_MIN_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const TCP_MIN_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const ICMP_HDR_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unparseable packet")]
    Unparseable,
}

/// Transport protocols the cursor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

/// Result of a full header walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headers {
    Arp,
    Ipv4(L4Proto),
    Ipv6(L4Proto),
}

/// Outer header offsets of a VXLAN-encapsulated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterOffsets {
    pub l2: usize,
    pub l3: usize,
    pub l4: usize,
    pub vxlan: usize,
}

/// Snapshot of the cursor's offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub l2: usize,
    pub l3: Option<usize>,
    pub l4: Option<usize>,
    pub payload: Option<usize>,
    pub outer: Option<OuterOffsets>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum L3Kind {
    Arp,
    Ipv4,
    Ipv6,
}

/// Offset-based cursor over a borrowed packet buffer.
pub struct PacketView<'a, B: PacketBuffer + ?Sized> {
    buf: &'a mut B,
    l2: usize,
    l3: Option<usize>,
    l4: Option<usize>,
    payload: Option<usize>,
    outer: Option<OuterOffsets>,
}

impl<'a, B: PacketBuffer + ?Sized> PacketView<'a, B> {
    /// Start a cursor with the Ethernet header at the start of the data.
    pub fn parse_l2(buf: &'a mut B) -> Self {
        Self {
            buf,
            l2: 0,
            l3: None,
            l4: None,
            payload: None,
            outer: None,
        }
    }

    /// Set the L3 offset right after the Ethernet header. The EtherType is
    /// checked by the typed accessors, not here.
    pub fn parse_l3(&mut self) {
        self.l3 = Some(self.l2 + ETHER_HDR_LEN);
        self.l4 = None;
        self.payload = None;
    }

    pub fn offsets(&self) -> Offsets {
        Offsets {
            l2: self.l2,
            l3: self.l3,
            l4: self.l4,
            payload: self.payload,
            outer: self.outer,
        }
    }

    pub fn is_overlay(&self) -> bool {
        self.outer.is_some()
    }

    pub fn frame_len(&self) -> usize {
        self.buf.data().len()
    }

    pub fn tailroom(&self) -> usize {
        self.buf.tailroom()
    }

    // ---- range computation (read-only) ----

    fn ethertype(&self) -> Option<EthernetProtocol> {
        let r = self.ether_range()?;
        Some(EthernetFrame::new_unchecked(&self.buf.data()[r]).ethertype())
    }

    fn l3_kind(&self) -> Option<L3Kind> {
        match self.ethertype()? {
            EthernetProtocol::Arp => Some(L3Kind::Arp),
            EthernetProtocol::Ipv4 => Some(L3Kind::Ipv4),
            EthernetProtocol::Ipv6 => Some(L3Kind::Ipv6),
            _ => None,
        }
    }

    fn ether_range(&self) -> Option<Range<usize>> {
        let end = self.l2 + ETHER_HDR_LEN;
        (end <= self.frame_len()).then_some(self.l2..end)
    }

    fn arp_range(&self) -> Option<Range<usize>> {
        let l3 = self.l3?;
        if self.l3_kind()? != L3Kind::Arp || l3 + ARP_LEN > self.frame_len() {
            return None;
        }
        Some(l3..l3 + ARP_LEN)
    }

    fn ipv4_range(&self) -> Option<Range<usize>> {
        let l3 = self.l3?;
        if self.l3_kind()? != L3Kind::Ipv4 {
            return None;
        }
        ipv4_header_range(self.buf.data(), l3)
    }

    fn ipv6_range(&self) -> Option<Range<usize>> {
        let l3 = self.l3?;
        let data = self.buf.data();
        if self.l3_kind()? != L3Kind::Ipv6 || l3 + IPV6_HDR_LEN > data.len() {
            return None;
        }
        let r = l3..l3 + IPV6_HDR_LEN;
        (Ipv6Packet::new_unchecked(&data[r.clone()]).version() == 6).then_some(r)
    }

    /// End of the IP datagram as declared by the L3 header. `None` when the
    /// declared length is inconsistent or exceeds the frame.
    fn datagram_end(&self) -> Option<usize> {
        let data = self.buf.data();
        let end = match self.l3_kind()? {
            L3Kind::Ipv4 => {
                let r = self.ipv4_range()?;
                let total = Ipv4Packet::new_unchecked(&data[r.clone()]).total_len() as usize;
                if total < r.len() {
                    return None;
                }
                r.start + total
            }
            L3Kind::Ipv6 => {
                let r = self.ipv6_range()?;
                r.end + Ipv6Packet::new_unchecked(&data[r.clone()]).payload_len() as usize
            }
            L3Kind::Arp => return None,
        };
        (end <= data.len()).then_some(end)
    }

    fn next_protocol(&self) -> Option<IpProtocol> {
        let data = self.buf.data();
        match self.l3_kind()? {
            L3Kind::Ipv4 => self
                .ipv4_range()
                .map(|r| Ipv4Packet::new_unchecked(&data[r]).next_header()),
            L3Kind::Ipv6 => self
                .ipv6_range()
                .map(|r| Ipv6Packet::new_unchecked(&data[r]).next_header()),
            L3Kind::Arp => None,
        }
    }

    fn l4_range(&self, proto: IpProtocol, min_len: usize) -> Option<Range<usize>> {
        let l4 = self.l4?;
        if self.next_protocol()? != proto {
            return None;
        }
        let end = self.datagram_end()?;
        (end >= l4 + min_len).then_some(l4..end)
    }

    fn tcp_range(&self) -> Option<Range<usize>> {
        let r = self.l4_range(IpProtocol::Tcp, TCP_MIN_HDR_LEN)?;
        let hdr_len = TcpPacket::new_unchecked(&self.buf.data()[r.clone()]).header_len() as usize;
        (hdr_len >= TCP_MIN_HDR_LEN && hdr_len <= r.len()).then_some(r)
    }

    fn udp_range(&self) -> Option<Range<usize>> {
        self.l4_range(IpProtocol::Udp, UDP_HDR_LEN)
    }

    fn icmp_range(&self) -> Option<Range<usize>> {
        self.l4_range(IpProtocol::Icmp, ICMP_HDR_LEN)
    }

    fn icmpv6_range(&self) -> Option<Range<usize>> {
        self.l4_range(IpProtocol::Icmpv6, ICMP_HDR_LEN)
    }

    // ---- typed accessors ----

    pub fn ether(&mut self) -> Option<EthernetFrame<&mut [u8]>> {
        let r = self.ether_range()?;
        Some(EthernetFrame::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn arp(&mut self) -> Option<ArpPacket<&mut [u8]>> {
        let r = self.arp_range()?;
        Some(ArpPacket::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn ipv4(&mut self) -> Option<Ipv4Packet<&mut [u8]>> {
        let r = self.ipv4_range()?;
        Some(Ipv4Packet::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn ipv6(&mut self) -> Option<Ipv6Packet<&mut [u8]>> {
        let r = self.ipv6_range()?;
        Some(Ipv6Packet::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn tcp(&mut self) -> Option<TcpPacket<&mut [u8]>> {
        let r = self.tcp_range()?;
        Some(TcpPacket::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn udp(&mut self) -> Option<UdpPacket<&mut [u8]>> {
        let r = self.udp_range()?;
        Some(UdpPacket::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn icmp(&mut self) -> Option<Icmpv4Packet<&mut [u8]>> {
        let r = self.icmp_range()?;
        Some(Icmpv4Packet::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    pub fn icmpv6(&mut self) -> Option<Icmpv6Packet<&mut [u8]>> {
        let r = self.icmpv6_range()?;
        Some(Icmpv6Packet::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    /// Source and destination octets of the IPv6 header, for pseudo-header
    /// checksums.
    pub fn ipv6_addr_octets(&self) -> Option<([u8; 16], [u8; 16])> {
        let r = self.ipv6_range()?;
        let hdr = &self.buf.data()[r];
        Some((hdr[8..24].try_into().ok()?, hdr[24..40].try_into().ok()?))
    }

    // ---- L4 / payload ----

    /// Set the L4 offset after the IPv4 header. Fails on IHL < 5, a header
    /// running past the frame, or any fragment.
    pub fn parse_l4_for_ipv4(&mut self) -> bool {
        let Some(r) = self.ipv4_range() else {
            return false;
        };
        if is_fragment(&Ipv4Packet::new_unchecked(&self.buf.data()[r.clone()])) {
            return false;
        }
        self.l4 = Some(r.end);
        self.payload = None;
        true
    }

    /// Set the L4 offset after the fixed IPv6 header. Extension headers are
    /// not walked.
    pub fn parse_l4_for_ipv6(&mut self) -> bool {
        let Some(r) = self.ipv6_range() else {
            return false;
        };
        self.l4 = Some(r.end);
        self.payload = None;
        true
    }

    /// Set the payload offset after the L4 header.
    pub fn parse_data(&mut self) -> Result<L4Proto, ParseError> {
        let data = self.buf.data();
        let (proto, offset) = if let Some(r) = self.tcp_range() {
            let hdr_len = TcpPacket::new_unchecked(&data[r.clone()]).header_len() as usize;
            (L4Proto::Tcp, r.start + hdr_len)
        } else if let Some(r) = self.udp_range() {
            (L4Proto::Udp, r.start + UDP_HDR_LEN)
        } else if let Some(r) = self.icmp_range() {
            (L4Proto::Icmp, r.start + ICMP_HDR_LEN)
        } else if let Some(r) = self.icmpv6_range() {
            (L4Proto::Icmpv6, r.start + ICMP_HDR_LEN)
        } else {
            return Err(ParseError::Unparseable);
        };
        self.payload = Some(offset);
        Ok(proto)
    }

    /// Walk L3, L4 and payload from the current L2 offset.
    pub fn parse(&mut self) -> Result<Headers, ParseError> {
        self.parse_l3();
        match self.l3_kind() {
            Some(L3Kind::Arp) if self.arp_range().is_some() => Ok(Headers::Arp),
            Some(L3Kind::Ipv4) => {
                if !self.parse_l4_for_ipv4() {
                    return Err(ParseError::Unparseable);
                }
                self.parse_data().map(Headers::Ipv4)
            }
            Some(L3Kind::Ipv6) => {
                if !self.parse_l4_for_ipv6() {
                    return Err(ParseError::Unparseable);
                }
                self.parse_data().map(Headers::Ipv6)
            }
            _ => Err(ParseError::Unparseable),
        }
    }

    // ---- VXLAN ----

    fn outer_offsets(&self, port: u16) -> Option<OuterOffsets> {
        let data = self.buf.data();
        if self.ethertype()? != EthernetProtocol::Ipv4 {
            return None;
        }
        let l3 = self.l2 + ETHER_HDR_LEN;
        let ip_range = ipv4_header_range(data, l3)?;
        let ip = Ipv4Packet::new_unchecked(&data[ip_range.clone()]);
        if ip.next_header() != IpProtocol::Udp || is_fragment(&ip) {
            return None;
        }
        let l4 = ip_range.end;
        if l4 + UDP_HDR_LEN > data.len()
            || UdpPacket::new_unchecked(&data[l4..l4 + UDP_HDR_LEN]).dst_port() != port
        {
            return None;
        }
        Some(OuterOffsets {
            l2: self.l2,
            l3,
            l4,
            vxlan: l4 + UDP_HDR_LEN,
        })
    }

    /// Detect a VXLAN frame and move the cursor to the inner frame.
    ///
    /// Returns `Ok(false)` with every offset untouched when the frame is not
    /// IPv4/UDP to `vxlan_port`. When it is, the outer offsets are recorded,
    /// L2 moves to the inner Ethernet header and the inner headers are
    /// parsed; an inner frame the cursor cannot walk is `Unparseable`.
    pub fn vxlan_decap(&mut self, vxlan_port: u16) -> Result<bool, ParseError> {
        if self.outer.is_some() {
            return Ok(true);
        }
        let Some(outer) = self.outer_offsets(vxlan_port) else {
            return Ok(false);
        };
        let inner_l2 = outer.vxlan + VXLAN_HDR_LEN;
        if inner_l2 + ETHER_HDR_LEN > self.frame_len() {
            return Err(ParseError::Unparseable);
        }
        self.outer = Some(outer);
        self.l2 = inner_l2;
        self.l3 = None;
        self.l4 = None;
        self.payload = None;
        self.parse().map(|_| true)
    }

    pub fn outer_ether(&mut self) -> Option<EthernetFrame<&mut [u8]>> {
        let o = self.outer?;
        Some(EthernetFrame::new_unchecked(
            &mut self.buf.data_mut()[o.l2..o.l2 + ETHER_HDR_LEN],
        ))
    }

    pub fn outer_ipv4(&mut self) -> Option<Ipv4Packet<&mut [u8]>> {
        let o = self.outer?;
        let r = ipv4_header_range(self.buf.data(), o.l3)?;
        Some(Ipv4Packet::new_unchecked(&mut self.buf.data_mut()[r]))
    }

    /// Outer UDP header only (8 bytes); the payload is the VXLAN frame.
    pub fn outer_udp(&mut self) -> Option<UdpPacket<&mut [u8]>> {
        let o = self.outer?;
        Some(UdpPacket::new_unchecked(
            &mut self.buf.data_mut()[o.l4..o.l4 + UDP_HDR_LEN],
        ))
    }

    pub fn vxlan(&mut self) -> Option<VxlanHeader<&mut [u8]>> {
        let o = self.outer?;
        Some(VxlanHeader::new_unchecked(
            &mut self.buf.data_mut()[o.vxlan..o.vxlan + VXLAN_HDR_LEN],
        ))
    }

    // ---- sizing ----

    /// Bytes from L4 to the end of the datagram declared by L3.
    pub fn l4_len(&self) -> Option<usize> {
        let l4 = self.l4?;
        let end = self.datagram_end()?;
        end.checked_sub(l4)
    }

    /// Make the L4 message `len` bytes long by growing into tailroom or
    /// trimming the tail. Ethernet padding after the datagram is discarded.
    /// L3 length fields are left to the caller.
    pub fn resize_l4(&mut self, len: usize) -> bool {
        let Some(l4) = self.l4 else {
            return false;
        };
        let want = l4 + len;
        let have = self.frame_len();
        if want > have {
            self.buf.append(want - have)
        } else {
            self.buf.trim(have - want)
        }
    }

    /// Read-only rendering of the parsed headers for packet tracing.
    pub fn summary(&self) -> PacketSummary {
        let data = self.buf.data();
        let outer = self.outer.and_then(|o| {
            let eth = EthernetFrame::new_unchecked(&data[o.l2..o.l2 + ETHER_HDR_LEN]);
            let ip = Ipv4Packet::new_unchecked(&data[ipv4_header_range(data, o.l3)?]);
            let vni = VxlanHeader::new_unchecked(&data[o.vxlan..o.vxlan + VXLAN_HDR_LEN]).vni();
            Some(OuterSummary {
                src_mac: eth.src_addr(),
                dst_mac: eth.dst_addr(),
                src: IpAddress::Ipv4(ip.src_addr()),
                dst: IpAddress::Ipv4(ip.dst_addr()),
                vni,
            })
        });

        let ether = self.ether_range().map(|r| {
            let eth = EthernetFrame::new_unchecked(&data[r]);
            (eth.src_addr(), eth.dst_addr(), u16::from(eth.ethertype()))
        });

        let l3 = if let Some(r) = self.arp_range() {
            let arp = ArpPacket::new_unchecked(&data[r]);
            // Address offsets depend on hlen/plen
            let (sender, target) = if arp.hardware_len() == 6 && arp.protocol_len() == 4 {
                (
                    ipv4_from_slice(arp.source_protocol_addr()),
                    ipv4_from_slice(arp.target_protocol_addr()),
                )
            } else {
                (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
            };
            L3Summary::Arp {
                op: u16::from(arp.operation()),
                sender,
                target,
            }
        } else if let Some(r) = self.ipv4_range() {
            let ip = Ipv4Packet::new_unchecked(&data[r]);
            L3Summary::Ip {
                src: IpAddress::Ipv4(ip.src_addr()),
                dst: IpAddress::Ipv4(ip.dst_addr()),
                proto: ip.next_header().into(),
                ttl: ip.hop_limit(),
            }
        } else if let Some(r) = self.ipv6_range() {
            let ip = Ipv6Packet::new_unchecked(&data[r]);
            L3Summary::Ip {
                src: IpAddress::Ipv6(ip.src_addr()),
                dst: IpAddress::Ipv6(ip.dst_addr()),
                proto: ip.next_header().into(),
                ttl: ip.hop_limit(),
            }
        } else {
            L3Summary::None
        };

        let l4 = if let Some(r) = self.tcp_range() {
            let tcp = TcpPacket::new_unchecked(&data[r]);
            L4Summary::Ports {
                proto: "tcp",
                src: tcp.src_port(),
                dst: tcp.dst_port(),
            }
        } else if let Some(r) = self.udp_range() {
            let udp = UdpPacket::new_unchecked(&data[r]);
            L4Summary::Ports {
                proto: "udp",
                src: udp.src_port(),
                dst: udp.dst_port(),
            }
        } else if let Some(r) = self.icmp_range() {
            let icmp = Icmpv4Packet::new_unchecked(&data[r]);
            L4Summary::Icmp {
                msg_type: icmp.msg_type().into(),
                code: icmp.msg_code(),
            }
        } else if let Some(r) = self.icmpv6_range() {
            let icmp = Icmpv6Packet::new_unchecked(&data[r]);
            L4Summary::Icmp {
                msg_type: icmp.msg_type().into(),
                code: icmp.msg_code(),
            }
        } else {
            L4Summary::None
        };

        PacketSummary {
            len: data.len(),
            outer,
            ether,
            l3,
            l4,
        }
    }
}

fn is_fragment<T: AsRef<[u8]>>(ip: &Ipv4Packet<T>) -> bool {
    ip.more_frags() || ip.frag_offset() != 0
}

fn ipv4_from_slice(octets: &[u8]) -> Ipv4Addr {
    <[u8; 4]>::try_from(octets).map_or(Ipv4Addr::UNSPECIFIED, Ipv4Addr::from)
}

/// Range of a well-formed IPv4 header starting at `l3`.
fn ipv4_header_range(data: &[u8], l3: usize) -> Option<Range<usize>> {
    if l3 + IPV4_MIN_HDR_LEN > data.len() {
        return None;
    }
    let ip = Ipv4Packet::new_unchecked(&data[l3..]);
    let hdr_len = ip.header_len() as usize;
    if ip.version() != 4 || hdr_len < IPV4_MIN_HDR_LEN || l3 + hdr_len > data.len() {
        return None;
    }
    Some(l3..l3 + hdr_len)
}

#[derive(Debug, Clone)]
struct OuterSummary {
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src: IpAddress,
    dst: IpAddress,
    vni: u32,
}

#[derive(Debug, Clone)]
enum L3Summary {
    None,
    Arp {
        op: u16,
        sender: Ipv4Addr,
        target: Ipv4Addr,
    },
    Ip {
        src: IpAddress,
        dst: IpAddress,
        proto: u8,
        ttl: u8,
    },
}

#[derive(Debug, Clone)]
enum L4Summary {
    None,
    Ports { proto: &'static str, src: u16, dst: u16 },
    Icmp { msg_type: u8, code: u8 },
}

/// Owned one-line description of a frame, see [`PacketView::summary`].
#[derive(Debug, Clone)]
pub struct PacketSummary {
    len: usize,
    outer: Option<OuterSummary>,
    ether: Option<(EthernetAddress, EthernetAddress, u16)>,
    l3: L3Summary,
    l4: L4Summary,
}

impl fmt::Display for PacketSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "len={}", self.len)?;
        if let Some(o) = &self.outer {
            write!(
                f,
                " vxlan[{} > {} {} > {} vni={}]",
                o.src_mac, o.dst_mac, o.src, o.dst, o.vni
            )?;
        }
        match &self.ether {
            Some((src, dst, ethertype)) => write!(f, " eth {src} > {dst} type={ethertype:#06x}")?,
            None => return write!(f, " runt"),
        }
        match &self.l3 {
            L3Summary::None => {}
            L3Summary::Arp { op, sender, target } => {
                write!(f, " arp op={op} {sender} > {target}")?
            }
            L3Summary::Ip {
                src,
                dst,
                proto,
                ttl,
            } => write!(f, " ip {src} > {dst} proto={proto} ttl={ttl}")?,
        }
        match &self.l4 {
            L4Summary::None => Ok(()),
            L4Summary::Ports { proto, src, dst } => write!(f, " {proto} {src} > {dst}"),
            L4Summary::Icmp { msg_type, code } => write!(f, " icmp type={msg_type} code={code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::packets::{self, MAC_A, MAC_B};
    use crate::dataplane::vxlan::VXLAN_PORT;
    use crate::test_util::{frame_buffer, test_pool};
    use smoltcp::wire::{ArpOperation, Ipv4Address};
    use std::net::Ipv6Addr;

    #[test]
    fn test_runt_frame_has_no_headers() {
        let pool = test_pool(4);
        let mut buf = frame_buffer(&pool, &[0u8; 10]);
        let mut view = PacketView::parse_l2(&mut buf);
        assert!(view.ether().is_none());
        assert_eq!(view.parse(), Err(ParseError::Unparseable));
    }

    #[test]
    fn test_parse_ipv4_icmp() {
        let pool = test_pool(4);
        let frame = packets::icmpv4_echo_request(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            1,
            &[0xab; 32],
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.parse(), Ok(Headers::Ipv4(L4Proto::Icmp)));
        let offsets = view.offsets();
        assert_eq!(offsets.l3, Some(14));
        assert_eq!(offsets.l4, Some(34));
        assert_eq!(offsets.payload, Some(42));
        assert_eq!(view.l4_len(), Some(40));

        assert!(view.icmp().is_some());
        assert!(view.icmpv6().is_none());
        assert!(view.udp().is_none());
        assert!(view.ipv6().is_none());
        assert!(view.arp().is_none());
        assert_eq!(
            view.ipv4().map(|ip| ip.src_addr()),
            Some(Ipv4Address::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn test_parse_ipv4_udp() {
        let pool = test_pool(4);
        let frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            12345,
            53,
            b"hello",
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.parse(), Ok(Headers::Ipv4(L4Proto::Udp)));
        let udp = view.udp().expect("udp header");
        assert_eq!(udp.src_port(), 12345);
        assert_eq!(udp.dst_port(), 53);
        assert_eq!(view.offsets().payload, Some(42));
    }

    #[test]
    fn test_parse_arp() {
        let pool = test_pool(4);
        let frame = packets::arp_request(MAC_A, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.parse(), Ok(Headers::Arp));
        assert!(view.ipv4().is_none());
        let arp = view.arp().expect("arp header");
        assert_eq!(arp.source_protocol_addr(), &[10, 0, 0, 5]);
        assert_eq!(arp.operation(), ArpOperation::Request);
    }

    #[test]
    fn test_parse_ipv6_icmpv6() {
        let pool = test_pool(4);
        let frame = packets::icmpv6_echo_request(
            MAC_A,
            MAC_B,
            "fe80::1".parse::<Ipv6Addr>().unwrap(),
            "fe80::2".parse::<Ipv6Addr>().unwrap(),
            7,
            1,
            b"ping",
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.parse(), Ok(Headers::Ipv6(L4Proto::Icmpv6)));
        assert_eq!(view.offsets().l4, Some(54));
        assert!(view.icmp().is_none());
        assert_eq!(view.icmpv6().map(|h| h.echo_ident()), Some(7));
    }

    #[test]
    fn test_ipv4_with_options() {
        let pool = test_pool(4);
        let mut frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1000,
            2000,
            b"x",
        );
        packets::add_ipv4_options(&mut frame, &[0x01, 0x01, 0x01, 0x00]);
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.parse(), Ok(Headers::Ipv4(L4Proto::Udp)));
        assert_eq!(view.offsets().l4, Some(14 + 24));
        assert_eq!(view.udp().map(|u| u.dst_port()), Some(2000));
    }

    #[test]
    fn test_ipv4_bad_ihl_fails() {
        let pool = test_pool(4);
        let mut frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"",
        );
        frame[14] = 0x44;
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse_l3();
        assert!(view.ipv4().is_none());
        assert!(!view.parse_l4_for_ipv4());
    }

    #[test]
    fn test_ipv4_fragment_not_parsed() {
        let pool = test_pool(4);
        let mut frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"frag",
        );
        frame[14 + 6] = 0x20;
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse_l3();
        assert!(view.ipv4().is_some());
        assert!(!view.parse_l4_for_ipv4());
        assert!(view.udp().is_none());
    }

    #[test]
    fn test_unknown_l4_unparseable() {
        let pool = test_pool(4);
        let mut frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"gre?",
        );
        frame[14 + 9] = 47;
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        assert_eq!(view.parse(), Err(ParseError::Unparseable));
        assert!(view.tcp().is_none());
        assert!(view.udp().is_none());
    }

    #[test]
    fn test_ethernet_padding_excluded_from_l4() {
        let pool = test_pool(4);
        let mut frame = packets::icmpv4_echo_request(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            1,
            &[],
        );
        // Pad to the Ethernet minimum
        frame.resize(60, 0);
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        assert_eq!(view.parse(), Ok(Headers::Ipv4(L4Proto::Icmp)));
        assert_eq!(view.l4_len(), Some(8));
        assert_eq!(view.icmp().map(|h| h.into_inner().len()), Some(8));
    }

    #[test]
    fn test_vxlan_decap_non_overlay_is_idempotent() {
        let pool = test_pool(4);
        let frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            4000,
            4790,
            b"not vxlan",
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        let before = view.offsets();

        assert_eq!(view.vxlan_decap(VXLAN_PORT), Ok(false));
        assert_eq!(view.offsets(), before);
        assert_eq!(view.vxlan_decap(VXLAN_PORT), Ok(false));
        assert_eq!(view.offsets(), before);
        assert!(!view.is_overlay());
    }

    #[test]
    fn test_vxlan_decap_arp_is_not_overlay() {
        let pool = test_pool(4);
        let frame = packets::arp_request(MAC_A, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        assert_eq!(view.vxlan_decap(VXLAN_PORT), Ok(false));
        assert_eq!(view.offsets().l2, 0);
    }

    #[test]
    fn test_vxlan_decap_overlay() {
        let pool = test_pool(4);
        let inner = packets::icmpv4_echo_request(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 2),
            1,
            1,
            &[0x11; 8],
        );
        let frame = packets::vxlan_encap(
            MAC_B,
            MAC_A,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            42,
            &inner,
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);

        assert_eq!(view.vxlan_decap(VXLAN_PORT), Ok(true));
        assert!(view.is_overlay());
        let offsets = view.offsets();
        let outer = offsets.outer.expect("outer offsets");
        assert_eq!(outer.l2, 0);
        assert_eq!(outer.l3, 14);
        assert_eq!(outer.l4, 34);
        assert_eq!(outer.vxlan, 42);
        assert_eq!(offsets.l2, 50);
        assert_eq!(offsets.l3, Some(64));
        assert_eq!(offsets.l4, Some(84));

        assert_eq!(view.vxlan().map(|v| v.vni()), Some(42));
        assert_eq!(
            view.ipv4().map(|ip| ip.dst_addr()),
            Some(Ipv4Address::new(192, 168, 0, 2))
        );
        assert_eq!(
            view.outer_ipv4().map(|ip| ip.dst_addr()),
            Some(Ipv4Address::new(172, 16, 0, 2))
        );
        assert_eq!(view.outer_udp().map(|u| u.dst_port()), Some(VXLAN_PORT));

        let text = view.summary().to_string();
        assert!(text.contains("vni=42"), "{text}");
        assert!(text.contains("192.168.0.1 > 192.168.0.2"), "{text}");
    }

    #[test]
    fn test_vxlan_decap_unparseable_inner() {
        let pool = test_pool(4);
        let mut inner = vec![0u8; 60];
        inner[12] = 0x88;
        inner[13] = 0xcc; // LLDP
        let frame = packets::vxlan_encap(
            MAC_B,
            MAC_A,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            1,
            &inner,
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        assert_eq!(view.vxlan_decap(VXLAN_PORT), Err(ParseError::Unparseable));
    }

    #[test]
    fn test_resize_l4() {
        let pool = test_pool(4);
        let frame = packets::icmpv4_echo_request(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            1,
            &[0; 16],
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();

        assert!(view.resize_l4(32));
        assert_eq!(view.frame_len(), 34 + 32);
        assert!(view.resize_l4(8));
        assert_eq!(view.frame_len(), 34 + 8);
        assert!(!view.resize_l4(4096));
    }

    #[test]
    fn test_summary_plain_frame() {
        let pool = test_pool(4);
        let frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            12345,
            53,
            b"q",
        );
        let mut buf = frame_buffer(&pool, &frame);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        let text = view.summary().to_string();
        assert!(text.contains("ip 10.0.0.1 > 10.0.0.2 proto=17"), "{text}");
        assert!(text.contains("udp 12345 > 53"), "{text}");
    }
}
