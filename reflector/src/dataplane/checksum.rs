//! Internet checksum arithmetic (RFC 1071).
//!
//! Everything here works on big-endian byte slices and 32-bit partial sums.
//! A partial sum is folded and complemented only once, at the end.

/// IP protocol number for ICMPv6, used in the IPv6 pseudo-header.
const PROTO_ICMPV6: u8 = 58;

/// IP protocol number for UDP.
const PROTO_UDP: u8 = 17;

/// One's-complement sum of `data` taken as big-endian 16-bit words.
///
/// An odd trailing byte is padded with zero on the right.
#[inline]
pub fn sum_words(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries back into the low 16 bits.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

/// Fold and complement a partial sum into a checksum field value.
#[inline]
pub fn finish(sum: u32) -> u16 {
    !fold(sum)
}

/// Checksum of a whole byte range. Yields zero when `data` already carries a
/// correct checksum.
#[inline]
pub fn internet(data: &[u8]) -> u16 {
    finish(sum_words(data))
}

/// Sum of `data` with the 16-bit field at `field` treated as zero.
#[inline]
fn sum_skipping(data: &[u8], field: usize) -> u32 {
    let head = &data[..field.min(data.len())];
    let tail = data.get(field + 2..).unwrap_or(&[]);
    // field is always even, so the tail starts on a word boundary
    sum_words(head).wrapping_add(sum_words(tail))
}

/// IPv4 header checksum over the complete header (`ihl * 4` bytes, options
/// included), ignoring the current checksum field at bytes 10..12.
pub fn ipv4_header(header: &[u8]) -> u16 {
    finish(sum_skipping(header, 10))
}

/// IPv4 pseudo-header partial sum.
#[inline]
pub fn ipv4_pseudo_header(src: [u8; 4], dst: [u8; 4], protocol: u8, len: u16) -> u32 {
    sum_words(&src)
        .wrapping_add(sum_words(&dst))
        .wrapping_add(protocol as u32)
        .wrapping_add(len as u32)
}

/// IPv6 pseudo-header partial sum (RFC 8200 §8.1).
#[inline]
pub fn ipv6_pseudo_header(src: [u8; 16], dst: [u8; 16], next_header: u8, len: u32) -> u32 {
    sum_words(&src)
        .wrapping_add(sum_words(&dst))
        .wrapping_add(len >> 16)
        .wrapping_add(len & 0xffff)
        .wrapping_add(next_header as u32)
}

/// ICMPv4 checksum over the whole message (header and data), ignoring the
/// checksum field.
pub fn icmpv4(message: &[u8]) -> u16 {
    finish(sum_skipping(message, 2))
}

/// ICMPv6 checksum: pseudo-header plus the whole message, ignoring the
/// checksum field.
pub fn icmpv6(src: [u8; 16], dst: [u8; 16], message: &[u8]) -> u16 {
    let pseudo = ipv6_pseudo_header(src, dst, PROTO_ICMPV6, message.len() as u32);
    finish(pseudo.wrapping_add(sum_skipping(message, 2)))
}

/// UDP checksum for IPv4. A computed zero is sent as 0xffff, since zero
/// means "no checksum" on the wire.
pub fn udp_ipv4(src: [u8; 4], dst: [u8; 4], datagram: &[u8]) -> u16 {
    let pseudo = ipv4_pseudo_header(src, dst, PROTO_UDP, datagram.len() as u16);
    nonzero(finish(pseudo.wrapping_add(sum_skipping(datagram, 6))))
}

/// UDP checksum for IPv6 (mandatory, never zero).
pub fn udp_ipv6(src: [u8; 16], dst: [u8; 16], datagram: &[u8]) -> u16 {
    let pseudo = ipv6_pseudo_header(src, dst, PROTO_UDP, datagram.len() as u32);
    nonzero(finish(pseudo.wrapping_add(sum_skipping(datagram, 6))))
}

#[inline]
fn nonzero(csum: u16) -> u16 {
    if csum == 0 { 0xffff } else { csum }
}
