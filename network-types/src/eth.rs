use core::mem;

/// Ethernet header structure that appears at the beginning of every Ethernet frame.
///
/// This structure represents the standard IEEE 802.3 Ethernet header format.
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                     destination_mac_addr                      |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  | destination_mac_addr (con't)  |        source_mac_addr        |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                    source_mac_addr (con't)                    |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           eth_type            |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct EthHdr {
    pub dst_addr: [u8; 6],
    pub src_addr: [u8; 6],
    /// Stored in network byte order.
    pub ether_type: [u8; 2],
}

impl EthHdr {
    pub const LEN: usize = mem::size_of::<EthHdr>();

    /// Returns the EtherType, or the raw host-order value when it is not one we know.
    #[inline]
    pub fn ether_type(&self) -> Result<EtherType, u16> {
        EtherType::try_from(u16::from_be_bytes(self.ether_type))
    }
}

/// Protocol which is encapsulated in the payload of the Ethernet frame.
/// Values are the IEEE assigned numbers in host byte order.
#[repr(u16)]
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ieee8021q = 0x8100,
    Ipv6 = 0x86DD,
}

impl TryFrom<u16> for EtherType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0800 => Ok(EtherType::Ipv4),
            0x0806 => Ok(EtherType::Arp),
            0x8100 => Ok(EtherType::Ieee8021q),
            0x86DD => Ok(EtherType::Ipv6),
            _ => Err(value),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(ether_type: EtherType) -> Self {
        ether_type as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eth_hdr_len() {
        assert_eq!(EthHdr::LEN, 14);
        assert_eq!(EthHdr::LEN, 6 + 6 + 2);
    }

    #[test]
    fn test_ether_type_reads_network_order() {
        let hdr = EthHdr {
            dst_addr: [0xff; 6],
            src_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            ether_type: [0x08, 0x00],
        };
        assert_eq!(hdr.ether_type(), Ok(EtherType::Ipv4));
    }

    #[test]
    fn test_ethertype_try_from_u16_unknown() {
        assert_eq!(EtherType::try_from(0x1234), Err(0x1234));
        assert_eq!(u16::from(EtherType::Ipv6), 0x86DD);
    }
}
