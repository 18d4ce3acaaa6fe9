use core::mem;

/// IANA-assigned UDP destination port for VXLAN.
pub const VXLAN_PORT: u16 = 4789;

/// Mask for the I-flag (VNI Present flag, bit 3) in the `flags` field.
pub const VXLAN_I_FLAG_MASK: u8 = 0x08;

/// VXLAN (Virtual eXtensible Local Area Network) header.
///
/// Encapsulates OSI layer 2 Ethernet frames within layer 4 UDP packets.
/// Header length: 8 bytes.
/// Reference: RFC 7348.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct VxlanHdr {
    /// Bit 3 (I flag) must be 1 if VNI is present. Other bits are reserved.
    pub flags: u8,
    pub _reserved1: [u8; 3],
    pub vni: [u8; 3],
    pub _reserved2: u8,
}

impl VxlanHdr {
    pub const LEN: usize = mem::size_of::<VxlanHdr>();

    /// True when the VNI-present flag is set, i.e. the header is a valid VXLAN header.
    #[inline]
    pub fn has_vni(&self) -> bool {
        self.flags & VXLAN_I_FLAG_MASK != 0
    }

    #[inline]
    pub fn vni(&self) -> u32 {
        u32::from_be_bytes([0, self.vni[0], self.vni[1], self.vni[2]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vxlanhdr_len() {
        assert_eq!(VxlanHdr::LEN, 8, "VXLAN header length should be 8 bytes");
    }

    #[test]
    fn test_vxlanhdr_flags_and_vni() {
        let hdr = VxlanHdr {
            flags: 0x08,
            _reserved1: [0; 3],
            vni: [0x12, 0x34, 0x56],
            _reserved2: 0,
        };
        assert!(hdr.has_vni());
        assert_eq!(hdr.vni(), 0x123456);

        let bare = VxlanHdr { flags: 0, ..hdr };
        assert!(!bare.has_vni());
    }
}
