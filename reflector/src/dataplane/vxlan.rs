//! VXLAN header (RFC 7348). smoltcp has no wire type for it.

pub const VXLAN_HDR_LEN: usize = 8;

/// IANA-assigned VXLAN destination port
pub const VXLAN_PORT: u16 = 4789;

/// Flags byte with the I bit set: the VNI field is valid.
pub const VXLAN_FLAG_VNI: u8 = 0x08;

#[derive(Debug)]
pub struct VxlanHeader<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> VxlanHeader<T> {
    pub fn new_unchecked(buf: T) -> Self {
        Self { buf }
    }

    pub fn flags(&self) -> u8 {
        self.buf.as_ref()[0]
    }

    /// 24-bit VXLAN network identifier.
    pub fn vni(&self) -> u32 {
        let b = self.buf.as_ref();
        u32::from_be_bytes([0, b[4], b[5], b[6]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vxlan_vni() {
        let hdr = [0x08, 0, 0, 0, 0x12, 0x34, 0x56, 0x00];
        let vxlan = VxlanHeader::new_unchecked(&hdr[..]);
        assert_eq!(vxlan.flags(), VXLAN_FLAG_VNI);
        assert_eq!(vxlan.vni(), 0x123456);
    }
}
