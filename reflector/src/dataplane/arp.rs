//! ARP responder
//!
//! Answers every Ethernet/IPv4 ARP request in place, claiming the requested
//! address for the responder MAC.

use std::net::Ipv4Addr;

use smoltcp::wire::{ArpHardware, ArpOperation, ArpPacket, EthernetAddress, EthernetProtocol};
use tracing::trace;

use super::buffer::PacketBuffer;
use super::packet::PacketView;
use super::rewrite::Action;

pub struct ArpResponder {
    mac: EthernetAddress,
}

fn is_ethernet_ipv4(arp: &ArpPacket<&mut [u8]>) -> bool {
    arp.hardware_type() == ArpHardware::Ethernet
        && arp.protocol_type() == EthernetProtocol::Ipv4
        && arp.hardware_len() == 6
        && arp.protocol_len() == 4
}

impl ArpResponder {
    pub fn new(mac: EthernetAddress) -> Self {
        Self { mac }
    }

    /// Turn an ARP request into the matching reply.
    ///
    /// Non-Ethernet/IPv4 ARP and anything but a request is dropped.
    pub fn respond<B: PacketBuffer + ?Sized>(&self, view: &mut PacketView<'_, B>) -> Action {
        let Some(mut arp) = view.arp() else {
            return Action::Drop;
        };
        if !is_ethernet_ipv4(&arp) || arp.operation() != ArpOperation::Request {
            return Action::Drop;
        }

        let requester = EthernetAddress::from_bytes(arp.source_hardware_addr());
        let mut sender_ip = [0u8; 4];
        sender_ip.copy_from_slice(arp.source_protocol_addr());
        let mut target_ip = [0u8; 4];
        target_ip.copy_from_slice(arp.target_protocol_addr());
        trace!(
            target_ip = %Ipv4Addr::from(target_ip),
            source_ip = %Ipv4Addr::from(sender_ip),
            source_mac = %requester,
            "ARP request"
        );

        arp.set_operation(ArpOperation::Reply);
        arp.set_source_protocol_addr(&target_ip);
        arp.set_target_protocol_addr(&sender_ip);
        arp.set_target_hardware_addr(requester.as_bytes());
        arp.set_source_hardware_addr(self.mac.as_bytes());

        let Some(mut eth) = view.ether() else {
            return Action::Drop;
        };
        eth.set_dst_addr(requester);
        eth.set_src_addr(self.mac);
        Action::Forward
    }
}
