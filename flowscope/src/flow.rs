//! Flow types shared by ingestion, distribution and the RPC layer.

use std::{borrow::Cow, fmt, net::Ipv4Addr, sync::Arc};

use flowscope_common::{VERDICT_DROP, VERDICT_FORWARD};

use crate::k8s::WorkloadInfo;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const VERDICT_FORWARDED_LABEL: &str = "FORWARDED";
pub const VERDICT_DROPPED_LABEL: &str = "DROPPED";

/// Identity of a flow as seen in one packet. Ports are zero for protocols
/// without ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} [{}]",
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            protocol_label(self.protocol)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Forwarded,
    Dropped,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Forwarded => VERDICT_FORWARDED_LABEL,
            Verdict::Dropped => VERDICT_DROPPED_LABEL,
        }
    }
}

impl TryFrom<u8> for Verdict {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            VERDICT_FORWARD => Ok(Verdict::Forwarded),
            VERDICT_DROP => Ok(Verdict::Dropped),
            other => Err(other),
        }
    }
}

/// A decoded kernel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub verdict: Verdict,
    /// Monotonic nanoseconds since boot of the node that captured the packet.
    pub timestamp_ns: u64,
    pub tunneled: bool,
}

/// `"TCP"`, `"UDP"` or `"UNKNOWN(<n>)"`.
pub fn protocol_label(protocol: u8) -> Cow<'static, str> {
    match protocol {
        PROTO_TCP => Cow::Borrowed("TCP"),
        PROTO_UDP => Cow::Borrowed("UDP"),
        other => Cow::Owned(format!("UNKNOWN({other})")),
    }
}

/// A flow record enriched with workload identity, ready for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEvent {
    pub record: FlowRecord,
    pub src_workload: Option<Arc<WorkloadInfo>>,
    pub dst_workload: Option<Arc<WorkloadInfo>>,
    pub protocol_label: Cow<'static, str>,
    pub verdict_label: &'static str,
    pub failure_reason: Option<String>,
}

impl FlowEvent {
    pub fn new(
        record: FlowRecord,
        src_workload: Option<Arc<WorkloadInfo>>,
        dst_workload: Option<Arc<WorkloadInfo>>,
    ) -> Self {
        let failure_reason = match record.verdict {
            Verdict::Forwarded => None,
            Verdict::Dropped => Some("dropped by datapath".to_string()),
        };
        Self {
            protocol_label: protocol_label(record.key.protocol),
            verdict_label: record.verdict.label(),
            record,
            src_workload,
            dst_workload,
            failure_reason,
        }
    }

    pub fn src_namespace(&self) -> Option<&str> {
        self.src_workload.as_deref().map(|w| w.namespace.as_str())
    }

    pub fn dst_namespace(&self) -> Option<&str> {
        self.dst_workload.as_deref().map(|w| w.namespace.as_str())
    }
}
