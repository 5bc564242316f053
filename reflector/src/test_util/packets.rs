//! Frame builders for tests
//!
//! Ethernet, ARP, IPv4 and ICMPv4 are emitted with smoltcp. UDP and the
//! ICMPv6 messages are laid out by hand and checksummed with
//! [`crate::dataplane::checksum`], then cross-checked in the tests.

use std::net::{Ipv4Addr, Ipv6Addr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
    Ipv6Address, Ipv6Packet, Ipv6Repr,
};

use crate::dataplane::checksum;

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// IPv6 fixed header size
pub const IPV6_HDR_SIZE: usize = 40;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// ARP packet size (Ethernet + IPv4)
pub const ARP_PKT_SIZE: usize = 28;

pub const MAC_A: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x0a]);
pub const MAC_B: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x0b]);
pub const RESPONDER_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const BROADCAST_MAC: EthernetAddress = EthernetAddress([0xff; 6]);

fn v4(addr: Ipv4Addr) -> Ipv4Address {
    let [a, b, c, d] = addr.octets();
    Ipv4Address::new(a, b, c, d)
}

fn v6(addr: Ipv6Addr) -> Ipv6Address {
    let s = addr.segments();
    Ipv6Address::new(s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7])
}

fn ethernet(
    packet: &mut [u8],
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    ethertype: EthernetProtocol,
) {
    let eth_repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(packet);
    eth_repr.emit(&mut eth_frame);
}

/// Ethernet + IPv4 header around an L4 message that is already laid out.
fn ipv4_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    next_header: IpProtocol,
    l4: &[u8],
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + l4.len()];
    ethernet(&mut packet, src_mac, dst_mac, EthernetProtocol::Ipv4);

    let ip_repr = Ipv4Repr {
        src_addr: v4(src_ip),
        dst_addr: v4(dst_ip),
        next_header,
        payload_len: l4.len(),
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet[ETHERNET_HDR_SIZE..]);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    ip_packet.payload_mut().copy_from_slice(l4);
    packet
}

/// Ethernet + IPv6 header around an L4 message that is already laid out.
fn ipv6_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    next_header: IpProtocol,
    hop_limit: u8,
    l4: &[u8],
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IPV6_HDR_SIZE + l4.len()];
    ethernet(&mut packet, src_mac, dst_mac, EthernetProtocol::Ipv6);

    let ip_repr = Ipv6Repr {
        src_addr: v6(src_ip),
        dst_addr: v6(dst_ip),
        next_header,
        payload_len: l4.len(),
        hop_limit,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(&mut packet[ETHERNET_HDR_SIZE..]);
    ip_repr.emit(&mut ip_packet);
    ip_packet.payload_mut().copy_from_slice(l4);
    packet
}

/// Create an ARP request from `sender_mac`/`sender_ip` asking for `target_ip`
pub fn arp_request(sender_mac: EthernetAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    arp(ArpOperation::Request, sender_mac, sender_ip, target_ip)
}

/// Create an unsolicited ARP reply (used to check that replies are ignored)
pub fn arp_reply(sender_mac: EthernetAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    arp(ArpOperation::Reply, sender_mac, sender_ip, target_ip)
}

fn arp(
    operation: ArpOperation,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + ARP_PKT_SIZE];
    ethernet(&mut packet, sender_mac, BROADCAST_MAC, EthernetProtocol::Arp);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: sender_mac,
        source_protocol_addr: v4(sender_ip),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: v4(target_ip),
    };
    let mut arp_packet = ArpPacket::new_unchecked(&mut packet[ETHERNET_HDR_SIZE..]);
    arp_repr.emit(&mut arp_packet);
    packet
}

/// Create an ICMP echo request
pub fn icmpv4_echo_request(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };
    let mut icmp = vec![0u8; icmp_repr.buffer_len()];
    let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut icmp[..]);
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

    ipv4_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Icmp, &icmp)
}

/// Create an ICMP message with an arbitrary type (no body)
pub fn icmpv4_message(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    msg_type: u8,
) -> Vec<u8> {
    let mut icmp = vec![0u8; 8];
    icmp[0] = msg_type;
    let csum = checksum::icmpv4(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    ipv4_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Icmp, &icmp)
}

/// Create a UDP datagram over IPv4 with a valid checksum
pub fn udpv4(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = udp_datagram(src_port, dst_port, payload);
    let csum = checksum::udp_ipv4(src_ip.octets(), dst_ip.octets(), &udp);
    udp[6..8].copy_from_slice(&csum.to_be_bytes());
    ipv4_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Udp, &udp)
}

/// Create a UDP datagram over IPv6 with a valid checksum
pub fn udpv6(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = udp_datagram(src_port, dst_port, payload);
    let csum = checksum::udp_ipv6(src_ip.octets(), dst_ip.octets(), &udp);
    udp[6..8].copy_from_slice(&csum.to_be_bytes());
    ipv6_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Udp, 64, &udp)
}

fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = UDP_HDR_SIZE + payload.len();
    let mut udp = vec![0u8; len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    udp[UDP_HDR_SIZE..].copy_from_slice(payload);
    udp
}

/// Create a TCP SYN over IPv4 (checksum left zero; TCP is never answered)
pub fn tcpv4_syn(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = 0x02;
    ipv4_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Tcp, &tcp)
}

/// Create an IPv4 packet with an arbitrary protocol number and payload
pub fn ipv4_raw(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    ipv4_frame(
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        IpProtocol::from(protocol),
        payload,
    )
}

/// Insert IPv4 options after the fixed header and fix up IHL, total length
/// and header checksum. `options` must be a multiple of four bytes.
pub fn add_ipv4_options(frame: &mut Vec<u8>, options: &[u8]) {
    assert_eq!(options.len() % 4, 0);
    let at = ETHERNET_HDR_SIZE + IP_HDR_SIZE;
    frame.splice(at..at, options.iter().copied());

    let ip = &mut frame[ETHERNET_HDR_SIZE..];
    let ihl = (IP_HDR_SIZE + options.len()) / 4;
    ip[0] = 0x40 | ihl as u8;
    let total = u16::from_be_bytes([ip[2], ip[3]]) + options.len() as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip[10..12].copy_from_slice(&[0, 0]);
    let csum = checksum::ipv4_header(&ip[..ihl * 4]);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn icmpv6_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    hop_limit: u8,
    mut msg: Vec<u8>,
) -> Vec<u8> {
    let csum = checksum::icmpv6(src_ip.octets(), dst_ip.octets(), &msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    ipv6_frame(
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        IpProtocol::Icmpv6,
        hop_limit,
        &msg,
    )
}

/// Create an ICMPv6 echo request
pub fn icmpv6_echo_request(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut msg = vec![0u8; 8 + data.len()];
    msg[0] = 128;
    msg[4..6].copy_from_slice(&ident.to_be_bytes());
    msg[6..8].copy_from_slice(&seq_no.to_be_bytes());
    msg[8..].copy_from_slice(data);
    icmpv6_frame(src_mac, dst_mac, src_ip, dst_ip, 64, msg)
}

/// Solicited-node multicast address for `target`
pub fn solicited_node(target: Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}

/// Create a Neighbor Solicitation for `target`, sent to its solicited-node
/// group. A source link-layer address option is added unless `src_ip` is
/// unspecified (RFC 4861 §4.3).
pub fn neighbor_solicitation(src_mac: EthernetAddress, src_ip: Ipv6Addr, target: Ipv6Addr) -> Vec<u8> {
    let with_sllao = !src_ip.is_unspecified();
    let mut msg = vec![0u8; if with_sllao { 32 } else { 24 }];
    msg[0] = 135;
    msg[8..24].copy_from_slice(&target.octets());
    if with_sllao {
        msg[24] = 1;
        msg[25] = 1;
        msg[26..32].copy_from_slice(src_mac.as_bytes());
    }

    let group = solicited_node(target);
    let o = group.octets();
    let dst_mac = EthernetAddress([0x33, 0x33, o[12], o[13], o[14], o[15]]);
    icmpv6_frame(src_mac, dst_mac, src_ip, group, 255, msg)
}

/// Create a Router Solicitation to all-routers
pub fn router_solicitation(src_mac: EthernetAddress, src_ip: Ipv6Addr) -> Vec<u8> {
    let mut msg = vec![0u8; 16];
    msg[0] = 133;
    msg[8] = 1;
    msg[9] = 1;
    msg[10..16].copy_from_slice(src_mac.as_bytes());
    let dst_mac = EthernetAddress([0x33, 0x33, 0, 0, 0, 2]);
    icmpv6_frame(src_mac, dst_mac, src_ip, Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2), 255, msg)
}

/// Wrap `inner` in Ethernet/IPv4/UDP/VXLAN. The outer UDP checksum is zero
/// and the source port is fixed.
pub fn vxlan_encap(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    vni: u32,
    inner: &[u8],
) -> Vec<u8> {
    let len = UDP_HDR_SIZE + 8 + inner.len();
    let mut udp = vec![0u8; len];
    udp[0..2].copy_from_slice(&49152u16.to_be_bytes());
    udp[2..4].copy_from_slice(&crate::dataplane::vxlan::VXLAN_PORT.to_be_bytes());
    udp[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    udp[8] = crate::dataplane::vxlan::VXLAN_FLAG_VNI;
    udp[12..15].copy_from_slice(&vni.to_be_bytes()[1..]);
    udp[16..].copy_from_slice(inner);
    ipv4_frame(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Udp, &udp)
}
