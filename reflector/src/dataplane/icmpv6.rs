//! ICMPv6 responder: echo and Neighbor Discovery
//!
//! - Echo Request -> Echo Reply
//! - Neighbor Solicitation -> Neighbor Advertisement carrying the responder
//!   MAC in a Target Link-Layer Address option
//! - Router Solicitation and everything else -> drop

use smoltcp::wire::{
    EthernetAddress, Icmpv6Message, Icmpv6Packet, Ipv6Address, NdiscNeighborFlags,
};
use tracing::trace;

use super::buffer::PacketBuffer;
use super::checksum;
use super::packet::PacketView;
use super::rewrite::{Action, swap_ether_addrs, swap_ipv6_addrs};

/// IPv6 all-nodes multicast address
pub const ALL_NODES_MULTICAST: Ipv6Address = Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Ethernet group address for ff02::1
pub const ALL_NODES_MAC: EthernetAddress = EthernetAddress([0x33, 0x33, 0, 0, 0, 1]);

/// Neighbor Solicitation: header (8) + target address (16)
const NS_MIN_LEN: usize = 24;

/// Neighbor Advertisement with one TLLAO: header (8) + target (16) + option (8)
pub const NA_LEN: usize = 32;

/// NDP option type: Target Link-Layer Address
const OPT_TARGET_LLADDR: u8 = 2;

/// ND messages must arrive and leave with hop limit 255 (RFC 4861 §7.1.1)
const ND_HOP_LIMIT: u8 = 255;

pub struct Icmpv6Responder {
    mac: EthernetAddress,
}

impl Icmpv6Responder {
    pub fn new(mac: EthernetAddress) -> Self {
        Self { mac }
    }

    pub fn respond<B: PacketBuffer + ?Sized>(&self, view: &mut PacketView<'_, B>) -> Action {
        let Some(msg_type) = view.icmpv6().map(|icmp| icmp.msg_type()) else {
            return Action::Drop;
        };
        match msg_type {
            Icmpv6Message::EchoRequest => echo_reply(view),
            Icmpv6Message::NeighborSolicit => self.neighbor_advertisement(view),
            _ => Action::Drop,
        }
    }

    /// Rewrite a Neighbor Solicitation into the advertisement for its target.
    ///
    /// The message is resized to exactly [`NA_LEN`] bytes; when that needs
    /// more tailroom than the buffer has, the packet is dropped untouched.
    fn neighbor_advertisement<B: PacketBuffer + ?Sized>(
        &self,
        view: &mut PacketView<'_, B>,
    ) -> Action {
        if view.l4_len().is_none_or(|len| len < NS_MIN_LEN) {
            return Action::Drop;
        }
        let Some((code, target)) = view
            .icmpv6()
            .map(|icmp| (icmp.msg_code(), icmp.target_addr()))
        else {
            return Action::Drop;
        };
        if code != 0 || target.is_multicast() {
            return Action::Drop;
        }

        let Some((solicitor, solicitor_mac)) = view
            .ipv6()
            .map(|ip| ip.src_addr())
            .zip(view.ether().map(|eth| eth.src_addr()))
        else {
            return Action::Drop;
        };

        // Duplicate address detection: answer all nodes, unsolicited
        let dad = solicitor.is_unspecified();
        let (dst, dst_mac, flags) = if dad {
            (ALL_NODES_MULTICAST, ALL_NODES_MAC, NdiscNeighborFlags::OVERRIDE)
        } else {
            (
                solicitor,
                solicitor_mac,
                NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE,
            )
        };
        trace!(%target, %solicitor, dad, "Neighbor Solicitation");

        if !view.resize_l4(NA_LEN) {
            return Action::Drop;
        }

        let Some(mut ip) = view.ipv6() else {
            return Action::Drop;
        };
        ip.set_payload_len(NA_LEN as u16);
        ip.set_src_addr(target);
        ip.set_dst_addr(dst);
        ip.set_hop_limit(ND_HOP_LIMIT);

        let Some((src_octets, dst_octets)) = view.ipv6_addr_octets() else {
            return Action::Drop;
        };
        let Some(mut icmp) = view.icmpv6() else {
            return Action::Drop;
        };
        icmp.set_msg_type(Icmpv6Message::NeighborAdvert);
        icmp.set_msg_code(0);
        icmp.set_neighbor_flags(flags);
        let msg = icmp.into_inner();
        msg[5..8].fill(0);
        // msg[8..24] keeps the target address
        msg[24] = OPT_TARGET_LLADDR;
        msg[25] = 1; // length in units of 8 bytes
        msg[26..32].copy_from_slice(self.mac.as_bytes());
        fill_checksum(msg, src_octets, dst_octets);

        let Some(mut eth) = view.ether() else {
            return Action::Drop;
        };
        eth.set_dst_addr(dst_mac);
        eth.set_src_addr(self.mac);
        Action::Forward
    }
}

fn fill_checksum(msg: &mut [u8], src: [u8; 16], dst: [u8; 16]) {
    let csum = checksum::icmpv6(src, dst, msg);
    Icmpv6Packet::new_unchecked(msg).set_checksum(csum);
}

/// Turn an ICMPv6 echo request into an echo reply in place.
fn echo_reply<B: PacketBuffer + ?Sized>(view: &mut PacketView<'_, B>) -> Action {
    let Some(mut ip) = view.ipv6() else {
        return Action::Drop;
    };
    swap_ipv6_addrs(&mut ip);

    let Some((src, dst)) = view.ipv6_addr_octets() else {
        return Action::Drop;
    };
    let Some(mut icmp) = view.icmpv6() else {
        return Action::Drop;
    };
    icmp.set_msg_type(Icmpv6Message::EchoReply);
    fill_checksum(icmp.into_inner(), src, dst);

    let Some(mut eth) = view.ether() else {
        return Action::Drop;
    };
    swap_ether_addrs(&mut eth);
    Action::Forward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::checksum;
    use crate::test_util::packets::{self, MAC_A, MAC_B, RESPONDER_MAC};
    use crate::test_util::{frame_buffer, test_pool, tight_pool};
    use smoltcp::wire::{EthernetFrame, Ipv6Packet};
    use std::net::Ipv6Addr;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn verify_icmpv6(frame: &[u8]) -> bool {
        let ip = &frame[14..54];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&ip[8..24]);
        dst.copy_from_slice(&ip[24..40]);
        let sum = checksum::ipv6_pseudo_header(src, dst, 58, (frame.len() - 54) as u32)
            + checksum::sum_words(&frame[54..]);
        checksum::finish(sum) == 0
    }

    #[test]
    fn test_echo_reply() {
        let pool = test_pool(4);
        let request = packets::icmpv6_echo_request(
            MAC_A,
            MAC_B,
            addr("2001:db8::1"),
            addr("2001:db8::2"),
            0x1234,
            5,
            b"ping from test!",
        );
        let mut buf = frame_buffer(&pool, &request);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Forward);

        let frame = EthernetFrame::new_checked(buf.data()).unwrap();
        assert_eq!(frame.src_addr(), MAC_B);
        assert_eq!(frame.dst_addr(), MAC_A);
        let ip = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(ip.src_addr(), Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2));
        assert_eq!(ip.dst_addr(), Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv6Message::EchoReply);
        assert_eq!(icmp.echo_ident(), 0x1234);
        assert_eq!(icmp.echo_seq_no(), 5);
        assert!(verify_icmpv6(buf.data()));
    }

    #[test]
    fn test_neighbor_solicitation_to_advertisement() {
        let pool = test_pool(4);
        let ns = packets::neighbor_solicitation(MAC_A, addr("fe80::2"), addr("fe80::1"));
        let mut buf = frame_buffer(&pool, &ns);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Forward);

        let data = buf.data();
        assert_eq!(data.len(), 14 + 40 + NA_LEN);

        let frame = EthernetFrame::new_checked(data).unwrap();
        assert_eq!(frame.dst_addr(), MAC_A);
        assert_eq!(frame.src_addr(), RESPONDER_MAC);

        let ip = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(ip.src_addr(), Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(ip.dst_addr(), Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 2));
        assert_eq!(ip.hop_limit(), 255);
        assert_eq!(ip.payload_len() as usize, NA_LEN);

        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv6Message::NeighborAdvert);
        assert_eq!(
            icmp.neighbor_flags(),
            NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE
        );
        assert_eq!(icmp.target_addr(), Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));

        let opt = &ip.payload()[24..32];
        assert_eq!(opt[0], 2);
        assert_eq!(opt[1], 1);
        assert_eq!(&opt[2..8], RESPONDER_MAC.as_bytes());
        assert!(verify_icmpv6(data));
    }

    #[test]
    fn test_dad_solicitation_goes_to_all_nodes() {
        let pool = test_pool(4);
        let ns = packets::neighbor_solicitation(MAC_A, Ipv6Addr::UNSPECIFIED, addr("fe80::1"));
        assert_eq!(ns.len(), 14 + 40 + 24);
        let mut buf = frame_buffer(&pool, &ns);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Forward);

        let data = buf.data();
        assert_eq!(data.len(), 14 + 40 + NA_LEN);
        let frame = EthernetFrame::new_checked(data).unwrap();
        assert_eq!(frame.dst_addr(), ALL_NODES_MAC);
        let ip = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(ip.dst_addr(), Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 1));
        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.neighbor_flags(), NdiscNeighborFlags::OVERRIDE);
        assert!(verify_icmpv6(data));
    }

    #[test]
    fn test_advertisement_without_tailroom_dropped() {
        let ns = packets::neighbor_solicitation(MAC_A, Ipv6Addr::UNSPECIFIED, addr("fe80::1"));
        let pool = tight_pool(2, ns.len());
        let mut buf = frame_buffer(&pool, &ns);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Drop);
        assert_eq!(buf.data(), &ns[..]);
    }

    #[test]
    fn test_multicast_target_dropped() {
        let pool = test_pool(4);
        let ns = packets::neighbor_solicitation(MAC_A, addr("fe80::2"), addr("ff02::1"));
        let mut buf = frame_buffer(&pool, &ns);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Drop);
    }

    #[test]
    fn test_nonzero_code_dropped() {
        let pool = test_pool(4);
        let mut ns = packets::neighbor_solicitation(MAC_A, addr("fe80::2"), addr("fe80::1"));
        ns[54 + 1] = 1;
        let mut buf = frame_buffer(&pool, &ns);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Drop);
    }

    #[test]
    fn test_router_solicitation_dropped() {
        let pool = test_pool(4);
        let rs = packets::router_solicitation(MAC_A, addr("fe80::2"));
        let mut buf = frame_buffer(&pool, &rs);
        let mut view = PacketView::parse_l2(&mut buf);
        view.parse().unwrap();
        assert_eq!(Icmpv6Responder::new(RESPONDER_MAC).respond(&mut view), Action::Drop);
    }
}
