use core::mem;

/// IANA protocol numbers the classifier cares about.
///
/// Kept as plain `u8` constants rather than an enum: the byte is loaded straight
/// from the packet and may hold any value.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 header, without options.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |ip_ver | h_len |  ip_dscp  |ecn|        ip_total_length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       ip_identification       |flags|   ip_fragment_offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    ip_ttl     |  ip_protocol  |          ip_checksum          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         source_ipaddr                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      destination_ipaddr                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct Ipv4Hdr {
    pub vihl: u8,
    pub tos: u8,
    pub tot_len: [u8; 2],
    pub id: [u8; 2],
    pub frags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub check: [u8; 2],
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

impl Ipv4Hdr {
    pub const LEN: usize = mem::size_of::<Ipv4Hdr>();

    #[inline]
    pub fn version(&self) -> u8 {
        self.vihl >> 4
    }

    /// Header length in bytes (IHL * 4).
    #[inline]
    pub fn ihl(&self) -> usize {
        ((self.vihl & 0x0F) as usize) * 4
    }

    /// Fragment offset in 8-byte units. Non-zero means this is not the first fragment.
    #[inline]
    pub fn frag_offset(&self) -> u16 {
        u16::from_be_bytes(self.frags) & 0x1FFF
    }

    /// Source address as its numeric value (`10.0.0.5` is `0x0A000005`).
    #[inline]
    pub fn src_addr(&self) -> u32 {
        u32::from_be_bytes(self.src_addr)
    }

    /// Destination address as its numeric value.
    #[inline]
    pub fn dst_addr(&self) -> u32 {
        u32::from_be_bytes(self.dst_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr() -> Ipv4Hdr {
        Ipv4Hdr {
            vihl: 0x45,
            tos: 0,
            tot_len: [0x00, 0x14],
            id: [0, 0],
            frags: [0x40, 0x00], // DF set, offset 0
            ttl: 64,
            proto: proto::TCP,
            check: [0, 0],
            src_addr: [10, 0, 0, 5],
            dst_addr: [10, 0, 0, 9],
        }
    }

    #[test]
    fn test_ipv4_hdr_len() {
        assert_eq!(Ipv4Hdr::LEN, 20);
    }

    #[test]
    fn test_ihl_and_version() {
        let h = hdr();
        assert_eq!(h.version(), 4);
        assert_eq!(h.ihl(), 20);
    }

    #[test]
    fn test_frag_offset_ignores_flags() {
        let mut h = hdr();
        assert_eq!(h.frag_offset(), 0);
        h.frags = [0x20, 0xb9]; // MF set, offset 185
        assert_eq!(h.frag_offset(), 185);
    }

    #[test]
    fn test_addresses_are_numeric() {
        let h = hdr();
        assert_eq!(h.src_addr(), 0x0A00_0005);
        assert_eq!(h.dst_addr(), 0x0A00_0009);
    }
}
