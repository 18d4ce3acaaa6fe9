//! Packet classifier: walks Ethernet / IPv4 / TCP|UDP (and one level of VXLAN)
//! and produces a complete [`RawFlowRecord`] or nothing.
//!
//! Every header is read through `TcContext::load`, which bounds-checks against the
//! packet length; a failed load aborts record construction for this packet only.

#[cfg(target_arch = "bpf")]
use aya_ebpf::programs::TcContext;
#[cfg(target_arch = "bpf")]
use aya_log_ebpf::{debug, trace};
use flowscope_common::{FLAG_TUNNELED, RawFlowRecord, VERDICT_FORWARD};
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{Ipv4Hdr, proto},
    tcp::TcpHdr,
    udp::UdpHdr,
    vxlan::{VXLAN_PORT, VxlanHdr},
};

#[cfg(not(target_arch = "bpf"))]
use crate::host::TcContext;

/// Upper bound on state machine steps. The longest path is
/// eth, ipv4, udp, vxlan, eth, ipv4, tcp.
pub const MAX_HEADER_PARSE_DEPTH: usize = 8;

// Defines what kind of header we expect to process in the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Ethernet,
    Ipv4,
    Tcp,
    Udp,
    Vxlan,
    /// The record is complete.
    StopProcessing,
    /// Not a flow we report (non-IPv4 frame).
    Unsupported,
}

pub struct Parser {
    // Current read offset from the start of the packet
    pub offset: usize,
    // The header-type to parse next at 'offset'
    pub next_hdr: HeaderType,
    // Set once a VXLAN header has been skipped; no second decapsulation.
    pub tunneled: bool,
    pub record: RawFlowRecord,
}

impl Default for Parser {
    fn default() -> Self {
        Parser {
            offset: 0,
            next_hdr: HeaderType::Ethernet,
            tunneled: false,
            record: RawFlowRecord::default(),
        }
    }
}

/// Classifies one packet. Returns `None` for anything that is not a fully
/// parseable IPv4 packet with non-zero addresses.
#[inline(always)]
pub fn classify(ctx: &TcContext, timestamp_ns: u64) -> Option<RawFlowRecord> {
    let mut parser = Parser::default();

    for _ in 0..MAX_HEADER_PARSE_DEPTH {
        let result: Result<(), ()> = match parser.next_hdr {
            HeaderType::Ethernet => parse_ethernet_header(ctx, &mut parser),
            HeaderType::Ipv4 => parse_ipv4_header(ctx, &mut parser),
            HeaderType::Tcp => parse_tcp_header(ctx, &mut parser),
            HeaderType::Udp => parse_udp_header(ctx, &mut parser),
            HeaderType::Vxlan => parse_vxlan_header(ctx, &mut parser),
            HeaderType::StopProcessing | HeaderType::Unsupported => break,
        };
        if result.is_err() {
            trace!(ctx, "flowscope: truncated or malformed header, no record");
            return None;
        }
    }

    if parser.next_hdr != HeaderType::StopProcessing {
        return None;
    }

    let mut record = parser.record;
    if record.src_addr == 0 || record.dst_addr == 0 {
        return None;
    }
    record.verdict = VERDICT_FORWARD;
    if parser.tunneled {
        record.flags |= FLAG_TUNNELED;
    }
    record.timestamp_ns = timestamp_ns;
    Some(record)
}

/// Parses the Ethernet header. Anything but IPv4 ends classification without a record.
///
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
pub fn parse_ethernet_header(ctx: &TcContext, parser: &mut Parser) -> Result<(), ()> {
    let eth_hdr: EthHdr = ctx.load(parser.offset).map_err(|_| ())?;
    parser.offset += EthHdr::LEN;

    match eth_hdr.ether_type() {
        Ok(EtherType::Ipv4) => parser.next_hdr = HeaderType::Ipv4,
        _ => {
            debug!(ctx, "flowscope: skipping non-ipv4 frame");
            parser.next_hdr = HeaderType::Unsupported;
        }
    }
    Ok(())
}

/// Parses the IPv4 header and captures addresses and protocol.
/// Fails on a version other than 4 or an IHL below 5.
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
/// |                          ip_options                           |
/// /                              ...                              /
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
pub fn parse_ipv4_header(ctx: &TcContext, parser: &mut Parser) -> Result<(), ()> {
    let ipv4_hdr: Ipv4Hdr = ctx.load(parser.offset).map_err(|_| ())?;
    let h_len = ipv4_hdr.ihl();
    if ipv4_hdr.version() != 4 || h_len < Ipv4Hdr::LEN {
        return Err(());
    }
    parser.offset += h_len;

    // policy: innermost IP header determines the flow IPs
    parser.record.src_addr = ipv4_hdr.src_addr();
    parser.record.dst_addr = ipv4_hdr.dst_addr();
    parser.record.protocol = ipv4_hdr.proto;
    parser.record.src_port = 0;
    parser.record.dst_port = 0;

    if ipv4_hdr.frag_offset() != 0 {
        // later fragments carry no transport header
        parser.next_hdr = HeaderType::StopProcessing;
        return Ok(());
    }

    parser.next_hdr = match ipv4_hdr.proto {
        proto::TCP => HeaderType::Tcp,
        proto::UDP => HeaderType::Udp,
        other => {
            debug!(ctx, "flowscope: protocol {} has no ports", other);
            HeaderType::StopProcessing
        }
    };
    Ok(())
}

/// Parses the fixed 20-byte TCP header for its ports.
///
///    0                   1                   2                   3
///    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Source Port          |       Destination Port        |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                        Sequence Number                        |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                    Acknowledgment Number                      |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |  Data |     |N|C|E|U|A|P|R|S|F|                               |
///   | Offset| Rsrv|S|R|C|R|C|S|S|Y|I|            Window             |
///   |       |     | |W|E|G|K|H|T|N|N|                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |           Checksum            |         Urgent Pointer        |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
pub fn parse_tcp_header(ctx: &TcContext, parser: &mut Parser) -> Result<(), ()> {
    let tcp_hdr: TcpHdr = ctx.load(parser.offset).map_err(|_| ())?;
    parser.offset += TcpHdr::LEN;

    parser.record.src_port = tcp_hdr.src_port();
    parser.record.dst_port = tcp_hdr.dst_port();
    parser.next_hdr = HeaderType::StopProcessing;
    Ok(())
}

/// Parses the UDP header for its ports. Traffic to the VXLAN port is handed to
/// [`parse_vxlan_header`] unless we are already inside a tunnel.
///
///   0                   1                   2                   3
///   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |          Source Port          |       Destination Port        |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |          PDU Length           |           Checksum            |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
pub fn parse_udp_header(ctx: &TcContext, parser: &mut Parser) -> Result<(), ()> {
    let udp_hdr: UdpHdr = ctx.load(parser.offset).map_err(|_| ())?;
    parser.offset += UdpHdr::LEN;

    parser.record.src_port = udp_hdr.src_port();
    parser.record.dst_port = udp_hdr.dst_port();
    parser.next_hdr = if udp_hdr.dst_port() == VXLAN_PORT && !parser.tunneled {
        HeaderType::Vxlan
    } else {
        HeaderType::StopProcessing
    };
    Ok(())
}

/// Skips a VXLAN header and restarts at the inner Ethernet frame.
///
/// An incomplete header, or one without the I flag, is not a tunnel: the outer
/// UDP flow already captured stands. Once decapsulated, the inner headers must
/// parse completely or no record is produced.
///
///   0                   1                   2                   3
///   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |R|R|R|R|I|R|R|R|            Reserved                           |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                VXLAN Network Identifier (VNI) |   Reserved    |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
pub fn parse_vxlan_header(ctx: &TcContext, parser: &mut Parser) -> Result<(), ()> {
    let vxlan_hdr: VxlanHdr = match ctx.load(parser.offset) {
        Ok(hdr) => hdr,
        Err(_) => {
            parser.next_hdr = HeaderType::StopProcessing;
            return Ok(());
        }
    };
    if !vxlan_hdr.has_vni() {
        parser.next_hdr = HeaderType::StopProcessing;
        return Ok(());
    }

    parser.offset += VxlanHdr::LEN;
    parser.tunneled = true;
    parser.record = RawFlowRecord::default();
    parser.next_hdr = HeaderType::Ethernet;
    Ok(())
}
