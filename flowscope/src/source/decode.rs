//! Decoding of `FLOW_EVENTS` records.
//!
//! Reads each field as little-endian at its pinned offset in
//! [`RawFlowRecord`], so the result does not depend on the host's byte order
//! or on the alignment of the ring buffer slot.

use std::net::Ipv4Addr;

use flowscope_common::{FLAG_TUNNELED, RawFlowRecord};

use crate::{
    flow::{FlowKey, FlowRecord, Verdict},
    source::DecodeError,
};

#[inline]
fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[inline]
fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Decodes one record. Trailing bytes past the fixed layout are ignored.
pub fn decode_record(bytes: &[u8]) -> Result<FlowRecord, DecodeError> {
    if bytes.len() < RawFlowRecord::LEN {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            expected: RawFlowRecord::LEN,
        });
    }

    let verdict_byte = bytes[RawFlowRecord::VERDICT_OFFSET];
    let verdict = Verdict::try_from(verdict_byte)
        .map_err(|verdict| DecodeError::Malformed { verdict })?;

    Ok(FlowRecord {
        key: FlowKey {
            src: Ipv4Addr::from(le_u32(bytes, RawFlowRecord::SRC_ADDR_OFFSET)),
            dst: Ipv4Addr::from(le_u32(bytes, RawFlowRecord::DST_ADDR_OFFSET)),
            src_port: le_u16(bytes, RawFlowRecord::SRC_PORT_OFFSET),
            dst_port: le_u16(bytes, RawFlowRecord::DST_PORT_OFFSET),
            protocol: bytes[RawFlowRecord::PROTOCOL_OFFSET],
        },
        verdict,
        timestamp_ns: le_u64(bytes, RawFlowRecord::TIMESTAMP_OFFSET),
        tunneled: bytes[RawFlowRecord::FLAGS_OFFSET] & FLAG_TUNNELED != 0,
    })
}

#[cfg(test)]
mod tests {
    use flowscope_common::{VERDICT_DROP, VERDICT_FORWARD};

    use super::*;

    fn raw(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> RawFlowRecord {
        RawFlowRecord {
            src_addr: u32::from_be_bytes(src),
            dst_addr: u32::from_be_bytes(dst),
            src_port: sport,
            dst_port: dport,
            protocol: 6,
            verdict: VERDICT_FORWARD,
            flags: 0,
            _pad: 0,
            timestamp_ns: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_decode_typical_record() {
        let bytes = raw([10, 0, 0, 5], [10, 0, 0, 9], 43210, 80).to_le_bytes();

        let record = decode_record(&bytes).unwrap();
        assert_eq!(record.key.src, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(record.key.dst, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(record.key.src_port, 43210);
        assert_eq!(record.key.dst_port, 80);
        assert_eq!(record.key.protocol, 6);
        assert_eq!(record.verdict, Verdict::Forwarded);
        assert_eq!(record.timestamp_ns, 1_700_000_000_123);
        assert!(!record.tunneled);
    }

    #[test]
    fn test_decode_boundary_values() {
        let mut rec = raw([255, 255, 255, 255], [255, 255, 255, 255], 65535, 65535);
        rec.protocol = 255;
        rec.verdict = VERDICT_DROP;
        rec.flags = FLAG_TUNNELED;
        rec.timestamp_ns = u64::MAX;

        let record = decode_record(&rec.to_le_bytes()).unwrap();
        assert_eq!(record.key.src, Ipv4Addr::BROADCAST);
        assert_eq!(record.key.dst, Ipv4Addr::BROADCAST);
        assert_eq!(record.key.src_port, 65535);
        assert_eq!(record.key.dst_port, 65535);
        assert_eq!(record.key.protocol, 255);
        assert_eq!(record.verdict, Verdict::Dropped);
        assert_eq!(record.timestamp_ns, u64::MAX);
        assert!(record.tunneled);
    }

    #[test]
    fn test_decode_reads_little_endian_regardless_of_host() {
        // 10.0.0.5 stored as 0x0A000005 little-endian
        let mut bytes = [0u8; RawFlowRecord::LEN];
        bytes[0..4].copy_from_slice(&[0x05, 0x00, 0x00, 0x0A]);
        bytes[4..8].copy_from_slice(&[0x09, 0x00, 0x00, 0x0A]);
        bytes[8..10].copy_from_slice(&[0x50, 0x00]);
        bytes[12] = 17;
        bytes[13] = VERDICT_FORWARD;

        let record = decode_record(&bytes).unwrap();
        assert_eq!(record.key.src, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(record.key.dst, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(record.key.src_port, 80);
    }

    #[test]
    fn test_short_record_is_truncated() {
        let bytes = raw([10, 0, 0, 5], [10, 0, 0, 9], 1, 2).to_le_bytes();

        let err = decode_record(&bytes[..RawFlowRecord::LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                len: 23,
                expected: 24
            }
        );
        assert_eq!(err.reason(), "truncated");
        assert!(decode_record(&[]).is_err());
    }

    #[test]
    fn test_unknown_verdict_is_malformed() {
        for verdict in [0u8, 3, 255] {
            let mut rec = raw([10, 0, 0, 5], [10, 0, 0, 9], 1, 2);
            rec.verdict = verdict;

            let err = decode_record(&rec.to_le_bytes()).unwrap_err();
            assert_eq!(err, DecodeError::Malformed { verdict });
            assert_eq!(err.reason(), "malformed");
        }
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut bytes = raw([10, 0, 0, 5], [10, 0, 0, 9], 1, 2).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 8]);

        assert!(decode_record(&bytes).is_ok());
    }
}
