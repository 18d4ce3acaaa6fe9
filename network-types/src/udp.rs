//! UDP header, which is present after the IP header.
//!
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          PDU Length           |           Checksum            |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! All fields are stored in network byte order (big-endian).

use core::mem;

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct UdpHdr {
    pub src: [u8; 2],
    pub dst: [u8; 2],
    pub len: [u8; 2],
    pub check: [u8; 2],
}

impl UdpHdr {
    pub const LEN: usize = mem::size_of::<UdpHdr>();

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src)
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst)
    }

    /// Length of header plus payload.
    #[inline]
    pub fn len(&self) -> u16 {
        u16::from_be_bytes(self.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == [0, 0]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_udp_constants() {
        assert_eq!(UdpHdr::LEN, 8);
    }

    #[test]
    fn test_udp_accessors() {
        let hdr = UdpHdr {
            src: [0x30, 0x39],
            dst: [0x12, 0xb5],
            len: [0x00, 0x08],
            check: [0, 0],
        };
        assert_eq!(hdr.src_port(), 12345);
        assert_eq!(hdr.dst_port(), 4789);
        assert_eq!(hdr.len(), 8);
        assert!(!hdr.is_empty());
    }
}
