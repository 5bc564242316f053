//! ICMP echo responder

use smoltcp::wire::{Icmpv4Message, Icmpv4Packet};

use super::buffer::PacketBuffer;
use super::checksum;
use super::packet::PacketView;
use super::rewrite::{Action, swap_ether_addrs, swap_ipv4_addrs};

/// Turn an ICMP echo request into an echo reply in place.
///
/// The ICMP checksum covers the message as bounded by the IPv4 total
/// length, so Ethernet padding never leaks into it. Every other ICMP type
/// is dropped.
pub fn echo_reply<B: PacketBuffer + ?Sized>(view: &mut PacketView<'_, B>) -> Action {
    let Some(mut icmp) = view.icmp() else {
        return Action::Drop;
    };
    if icmp.msg_type() != Icmpv4Message::EchoRequest {
        return Action::Drop;
    }
    icmp.set_msg_type(Icmpv4Message::EchoReply);
    let msg = icmp.into_inner();
    let csum = checksum::icmpv4(msg);
    Icmpv4Packet::new_unchecked(msg).set_checksum(csum);

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
