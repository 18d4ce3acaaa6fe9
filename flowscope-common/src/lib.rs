#![no_std]

use core::mem::{self, offset_of};

/// Verdict byte for a packet the datapath let through.
pub const VERDICT_FORWARD: u8 = 1;
/// Verdict byte for a packet the datapath dropped. Never produced by the classifier
/// today; reserved for an admission hook.
pub const VERDICT_DROP: u8 = 2;

/// `flags` bit set when the record describes the inner flow of a VXLAN packet.
pub const FLAG_TUNNELED: u8 = 0b0000_0001;

/// One observed packet, as written by the classifier into the `FLOW_EVENTS`
/// ring buffer and read back by userspace.
///
/// The layout is pinned: every multi-byte integer is little-endian (the classifier
/// targets `bpfel`), addresses hold the numeric IPv4 value (`10.0.0.5` is
/// `0x0A000005`), ports hold the host value. Userspace decodes by offset, never
/// by pointer cast, so the offsets below are part of the contract.
///
/// ```text
///  0        4        8     10    12  13  14  15  16               24
///  +--------+--------+-----+-----+---+---+---+---+----------------+
///  |src_addr|dst_addr|sport|dport|prt|vrd|flg|pad|  timestamp_ns  |
///  +--------+--------+-----+-----+---+---+---+---+----------------+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFlowRecord {
    // Fields with 4-byte alignment
    pub src_addr: u32,
    pub dst_addr: u32,
    // Fields with 2-byte alignment
    pub src_port: u16,
    pub dst_port: u16,
    // Fields with 1-byte alignment
    pub protocol: u8,
    pub verdict: u8,
    pub flags: u8,
    /// Keeps `timestamp_ns` naturally aligned on both sides. Always zero.
    pub _pad: u8,
    // Fields with 8-byte alignment
    /// `bpf_ktime_get_ns()`: monotonic, nanoseconds since boot of the producing node.
    pub timestamp_ns: u64,
}

impl RawFlowRecord {
    pub const LEN: usize = mem::size_of::<RawFlowRecord>();

    pub const SRC_ADDR_OFFSET: usize = offset_of!(RawFlowRecord, src_addr);
    pub const DST_ADDR_OFFSET: usize = offset_of!(RawFlowRecord, dst_addr);
    pub const SRC_PORT_OFFSET: usize = offset_of!(RawFlowRecord, src_port);
    pub const DST_PORT_OFFSET: usize = offset_of!(RawFlowRecord, dst_port);
    pub const PROTOCOL_OFFSET: usize = offset_of!(RawFlowRecord, protocol);
    pub const VERDICT_OFFSET: usize = offset_of!(RawFlowRecord, verdict);
    pub const FLAGS_OFFSET: usize = offset_of!(RawFlowRecord, flags);
    pub const TIMESTAMP_OFFSET: usize = offset_of!(RawFlowRecord, timestamp_ns);

    #[inline]
    pub fn is_tunneled(&self) -> bool {
        self.flags & FLAG_TUNNELED != 0
    }

    /// Serializes the record in the pinned little-endian layout.
    ///
    /// On a little-endian producer this is byte-for-byte the in-memory struct.
    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[Self::SRC_ADDR_OFFSET..Self::SRC_ADDR_OFFSET + 4]
            .copy_from_slice(&self.src_addr.to_le_bytes());
        out[Self::DST_ADDR_OFFSET..Self::DST_ADDR_OFFSET + 4]
            .copy_from_slice(&self.dst_addr.to_le_bytes());
        out[Self::SRC_PORT_OFFSET..Self::SRC_PORT_OFFSET + 2]
            .copy_from_slice(&self.src_port.to_le_bytes());
        out[Self::DST_PORT_OFFSET..Self::DST_PORT_OFFSET + 2]
            .copy_from_slice(&self.dst_port.to_le_bytes());
        out[Self::PROTOCOL_OFFSET] = self.protocol;
        out[Self::VERDICT_OFFSET] = self.verdict;
        out[Self::FLAGS_OFFSET] = self.flags;
        out[Self::TIMESTAMP_OFFSET..Self::TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out
    }
}

const _: () = assert!(RawFlowRecord::LEN == 24);
const _: () = assert!(mem::align_of::<RawFlowRecord>() == 8);
const _: () = assert!(RawFlowRecord::SRC_ADDR_OFFSET == 0);
const _: () = assert!(RawFlowRecord::DST_ADDR_OFFSET == 4);
const _: () = assert!(RawFlowRecord::SRC_PORT_OFFSET == 8);
const _: () = assert!(RawFlowRecord::DST_PORT_OFFSET == 10);
const _: () = assert!(RawFlowRecord::PROTOCOL_OFFSET == 12);
const _: () = assert!(RawFlowRecord::VERDICT_OFFSET == 13);
const _: () = assert!(RawFlowRecord::FLAGS_OFFSET == 14);
const _: () = assert!(RawFlowRecord::TIMESTAMP_OFFSET == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_record_is_zeroed() {
        let record = RawFlowRecord::default();
        assert_eq!(record.to_le_bytes(), [0u8; RawFlowRecord::LEN]);
        assert!(!record.is_tunneled());
    }

    #[test]
    fn test_le_bytes_match_in_memory_layout_on_little_endian() {
        let record = RawFlowRecord {
            src_addr: 0x0A00_0005,
            dst_addr: 0x0A00_0009,
            src_port: 43210,
            dst_port: 80,
            protocol: 6,
            verdict: VERDICT_FORWARD,
            flags: FLAG_TUNNELED,
            _pad: 0,
            timestamp_ns: 0x0102_0304_0506_0708,
        };

        let bytes = record.to_le_bytes();
        assert_eq!(&bytes[0..4], &[0x05, 0x00, 0x00, 0x0A]);
        assert_eq!(&bytes[8..10], &43210u16.to_le_bytes());
        assert_eq!(bytes[13], VERDICT_FORWARD);
        assert_eq!(bytes[14], FLAG_TUNNELED);
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[16..24], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        #[cfg(target_endian = "little")]
        {
            // SAFETY: RawFlowRecord is repr(C), Copy, 24 bytes with explicit padding.
            let raw: [u8; RawFlowRecord::LEN] = unsafe { mem::transmute(record) };
            assert_eq!(raw, bytes);
        }
    }
}
