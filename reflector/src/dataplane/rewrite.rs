//! Per-protocol in-place rewrite
//!
//! [`RewriteEngine::process`] decides what happens to one frame and mutates
//! it so it can go straight back out on the queue it came from:
//!
//! | Frame                      | Result                                    |
//! |----------------------------|-------------------------------------------|
//! | ARP request                | ARP reply from the responder MAC          |
//! | ICMP echo request          | echo reply                                |
//! | UDP (IPv4 or IPv6)         | addresses and ports swapped               |
//! | ICMPv6 echo request        | echo reply                                |
//! | Neighbor Solicitation      | Neighbor Advertisement                    |
//! | VXLAN around any of these  | inner rewritten, outer headers swapped    |
//! | anything else              | drop                                      |

use smoltcp::wire::{EthernetAddress, EthernetFrame, Ipv4Packet, Ipv6Packet, UdpPacket};

use super::arp::ArpResponder;
use super::buffer::PacketBuffer;
use super::icmp;
use super::icmpv6::Icmpv6Responder;
use super::packet::{Headers, L4Proto, PacketView};

/// What the worker does with a frame after [`RewriteEngine::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Transmit the (rewritten) frame on the paired queue
    Forward,
    /// Release the buffer
    Drop,
}

pub struct RewriteEngine {
    arp: ArpResponder,
    icmpv6: Icmpv6Responder,
}

impl RewriteEngine {
    pub fn new(responder_mac: EthernetAddress) -> Self {
        Self {
            arp: ArpResponder::new(responder_mac),
            icmpv6: Icmpv6Responder::new(responder_mac),
        }
    }

    /// Rewrite the frame under `view` in place.
    ///
    /// Headers are walked from the view's current L2, so an overlay view
    /// (after [`PacketView::vxlan_decap`]) rewrites the inner frame and then
    /// reflects the outer headers.
    pub fn process<B: PacketBuffer + ?Sized>(&self, view: &mut PacketView<'_, B>) -> Action {
        let Ok(headers) = view.parse() else {
            return Action::Drop;
        };
        let frame_len = view.frame_len();

        let action = match headers {
            Headers::Arp => self.arp.respond(view),
            Headers::Ipv4(L4Proto::Icmp) => icmp::echo_reply(view),
            Headers::Ipv4(L4Proto::Udp) => reflect_udp_v4(view),
            Headers::Ipv6(L4Proto::Icmpv6) => self.icmpv6.respond(view),
            Headers::Ipv6(L4Proto::Udp) => reflect_udp_v6(view),
            Headers::Ipv4(_) | Headers::Ipv6(_) => Action::Drop,
        };

        if action == Action::Forward && view.is_overlay() {
            return reflect_outer(view, frame_len);
        }
        action
    }
}

pub(super) fn swap_ether_addrs(eth: &mut EthernetFrame<&mut [u8]>) {
    let (src, dst) = (eth.src_addr(), eth.dst_addr());
    eth.set_src_addr(dst);
    eth.set_dst_addr(src);
}

/// Swap source and destination and refresh the header checksum.
pub(super) fn swap_ipv4_addrs(ip: &mut Ipv4Packet<&mut [u8]>) {
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    ip.set_src_addr(dst);
    ip.set_dst_addr(src);
    ip.fill_checksum();
}

pub(super) fn swap_ipv6_addrs(ip: &mut Ipv6Packet<&mut [u8]>) {
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    ip.set_src_addr(dst);
    ip.set_dst_addr(src);
}

fn swap_udp_ports(udp: &mut UdpPacket<&mut [u8]>) {
    let (src, dst) = (udp.src_port(), udp.dst_port());
    udp.set_src_port(dst);
    udp.set_dst_port(src);
}

/// Swap Ethernet, IPv4 addresses and UDP ports.
///
/// The UDP checksum is left alone: swapping both address pairs and both
/// ports leaves the pseudo-header and header sums unchanged.
fn reflect_udp_v4<B: PacketBuffer + ?Sized>(view: &mut PacketView<'_, B>) -> Action {
    let Some(mut udp) = view.udp() else {
        return Action::Drop;
    };
    swap_udp_ports(&mut udp);

    let Some(mut ip) = view.ipv4() else {
        return Action::Drop;
    };
    swap_ipv4_addrs(&mut ip);

    let Some(mut eth) = view.ether() else {
        return Action::Drop;
    };
    swap_ether_addrs(&mut eth);
    Action::Forward
}

/// Swap Ethernet, IPv6 addresses and UDP ports.
fn reflect_udp_v6<B: PacketBuffer + ?Sized>(view: &mut PacketView<'_, B>) -> Action {
    let Some(mut udp) = view.udp() else {
        return Action::Drop;
    };
    swap_udp_ports(&mut udp);

    let Some(mut ip) = view.ipv6() else {
        return Action::Drop;
    };
    swap_ipv6_addrs(&mut ip);

    let Some(mut eth) = view.ether() else {
        return Action::Drop;
    };
    swap_ether_addrs(&mut eth);
    Action::Forward
}

/// Send a rewritten inner frame back through the tunnel.
///
/// Outer Ethernet and IPv4 addresses are swapped and the outer UDP checksum
/// is zeroed (allowed for VXLAN over IPv4). The outer UDP ports are kept.
/// If the inner frame changed size, the outer IPv4 and UDP lengths follow
/// it.
fn reflect_outer<B: PacketBuffer + ?Sized>(
    view: &mut PacketView<'_, B>,
    old_frame_len: usize,
) -> Action {
    let frame_len = view.frame_len();
    let Some(outer) = view.offsets().outer else {
        return Action::Drop;
    };

    let Some(mut udp) = view.outer_udp() else {
        return Action::Drop;
    };
    if frame_len != old_frame_len {
        udp.set_len((frame_len - outer.l4) as u16);
    }
    udp.set_checksum(0);

    let Some(mut ip) = view.outer_ipv4() else {
        return Action::Drop;
    };
    if frame_len != old_frame_len {
        ip.set_total_len((frame_len - outer.l3) as u16);
    }
    swap_ipv4_addrs(&mut ip);

    let Some(mut eth) = view.outer_ether() else {
        return Action::Drop;
    };
    swap_ether_addrs(&mut eth);
    Action::Forward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::checksum;
    use crate::dataplane::vxlan::VXLAN_PORT;
    use crate::test_util::packets::{self, MAC_A, MAC_B, RESPONDER_MAC};
    use crate::test_util::{frame_buffer, test_pool};
    use smoltcp::wire::{EthernetFrame, Ipv4Address, Ipv4Packet, Ipv6Packet, UdpPacket};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn run(frame: &[u8]) -> (Action, Vec<u8>) {
        let pool = test_pool(2);
        let mut buf = frame_buffer(&pool, frame);
        let mut view = PacketView::parse_l2(&mut buf);
        let action = match view.vxlan_decap(VXLAN_PORT) {
            Ok(_) => RewriteEngine::new(RESPONDER_MAC).process(&mut view),
            Err(_) => Action::Drop,
        };
        (action, buf.data().to_vec())
    }

    #[test]
    fn test_udpv4_swapped_and_checksum_valid() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let frame = packets::udpv4(MAC_A, MAC_B, src, dst, 12345, 53, b"query");
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Forward);

        let eth = EthernetFrame::new_checked(&out[..]).unwrap();
        assert_eq!(eth.src_addr(), MAC_B);
        assert_eq!(eth.dst_addr(), MAC_A);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.src_addr(), Ipv4Address::new(10, 0, 0, 2));
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 12345);

        // Still verifies against the swapped pseudo-header
        assert_eq!(
            checksum::udp_ipv4(dst.octets(), src.octets(), ip.payload()),
            udp.checksum()
        );
    }

    #[test]
    fn test_udpv6_swapped_and_checksum_valid() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = packets::udpv6(MAC_A, MAC_B, src, dst, 5000, 6000, b"data");
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Forward);

        let eth = EthernetFrame::new_checked(&out[..]).unwrap();
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 6000);
        assert_eq!(udp.dst_port(), 5000);
        assert_eq!(
            checksum::udp_ipv6(dst.octets(), src.octets(), ip.payload()),
            udp.checksum()
        );
    }

    #[test]
    fn test_zero_udp_checksum_stays_zero() {
        let mut frame = packets::udpv4(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"nocsum",
        );
        frame[34 + 6..34 + 8].copy_from_slice(&[0, 0]);
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Forward);
        assert_eq!(&out[34 + 6..34 + 8], &[0, 0]);
    }

    #[test]
    fn test_gre_dropped() {
        let frame = packets::ipv4_raw(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            47,
            &[0; 16],
        );
        assert_eq!(run(&frame).0, Action::Drop);
    }

    #[test]
    fn test_tcp_dropped() {
        let frame = packets::tcpv4_syn(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            80,
        );
        assert_eq!(run(&frame).0, Action::Drop);
    }

    #[test]
    fn test_unknown_ethertype_dropped() {
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&[0x88, 0xcc]);
        assert_eq!(run(&frame).0, Action::Drop);
    }

    #[test]
    fn test_router_solicitation_dropped() {
        let rs = packets::router_solicitation(MAC_A, "fe80::2".parse().unwrap());
        assert_eq!(run(&rs).0, Action::Drop);
    }

    #[test]
    fn test_overlay_icmp_echo() {
        let inner = packets::icmpv4_echo_request(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            1,
            1,
            &[0xab; 32],
        );
        let outer_src_mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x10]);
        let outer_dst_mac = EthernetAddress([0x02, 0, 0, 0, 0, 0x20]);
        let frame = packets::vxlan_encap(
            outer_src_mac,
            outer_dst_mac,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            100,
            &inner,
        );
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Forward);
        assert_eq!(out.len(), frame.len());

        let eth = EthernetFrame::new_checked(&out[..]).unwrap();
        assert_eq!(eth.src_addr(), outer_dst_mac);
        assert_eq!(eth.dst_addr(), outer_src_mac);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.src_addr(), Ipv4Address::new(172, 16, 0, 2));
        assert_eq!(ip.dst_addr(), Ipv4Address::new(172, 16, 0, 1));
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.checksum(), 0);
        // Ports are not swapped: the peer keeps its flow entropy port
        assert_eq!(udp.src_port(), 49152);
        assert_eq!(udp.dst_port(), VXLAN_PORT);

        let inner_out = &udp.payload()[8..];
        let inner_eth = EthernetFrame::new_checked(inner_out).unwrap();
        assert_eq!(inner_eth.src_addr(), MAC_B);
        let inner_ip = Ipv4Packet::new_checked(inner_eth.payload()).unwrap();
        assert!(inner_ip.verify_checksum());
        assert_eq!(inner_ip.src_addr(), Ipv4Address::new(192, 168, 1, 2));
        assert_eq!(inner_ip.payload()[0], 0, "echo reply type");
        assert_eq!(checksum::internet(inner_ip.payload()), 0);
    }

    #[test]
    fn test_overlay_neighbor_advertisement_grows_outer() {
        let inner = packets::neighbor_solicitation(
            MAC_A,
            Ipv6Addr::UNSPECIFIED,
            "fe80::1".parse().unwrap(),
        );
        let frame = packets::vxlan_encap(
            MAC_B,
            MAC_A,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            7,
            &inner,
        );
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Forward);
        assert_eq!(out.len(), frame.len() + 8);

        let eth = EthernetFrame::new_checked(&out[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.total_len() as usize, out.len() - 14);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.len() as usize, out.len() - 34);
        assert_eq!(udp.checksum(), 0);
    }

    #[test]
    fn test_overlay_unparseable_inner_dropped() {
        let mut inner = vec![0u8; 60];
        inner[12..14].copy_from_slice(&[0x88, 0xcc]);
        let frame = packets::vxlan_encap(
            MAC_B,
            MAC_A,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            7,
            &inner,
        );
        assert_eq!(run(&frame).0, Action::Drop);
    }

    #[test]
    fn test_overlay_inner_tcp_dropped() {
        let inner = packets::tcpv4_syn(
            MAC_A,
            MAC_B,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            1,
            2,
        );
        let frame = packets::vxlan_encap(
            MAC_B,
            MAC_A,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            7,
            &inner,
        );
        let (action, out) = run(&frame);
        assert_eq!(action, Action::Drop);
        assert_eq!(out, frame);
    }
}
