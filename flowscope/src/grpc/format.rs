//! Human and machine renderings of flows and service-map edges.

use crate::grpc::pb;

/// `name (namespace)`, falling back to `ip:port` when the endpoint has no
/// identity. The port is omitted when zero.
fn endpoint(pod: Option<&pb::PodInfo>, ip: &str, port: u32) -> String {
    match pod {
        Some(pod) if !pod.name.is_empty() => {
            if pod.namespace.is_empty() {
                pod.name.clone()
            } else {
                format!("{} ({})", pod.name, pod.namespace)
            }
        }
        _ if port != 0 => format!("{ip}:{port}"),
        _ => ip.to_string(),
    }
}

/// `frontend (default) -> catalog (default) [TCP] (FORWARDED)`
pub fn flow_text(flow: &pb::Flow) -> String {
    format!(
        "{} -> {} [{}] ({})",
        endpoint(flow.src_pod.as_ref(), &flow.src_ip, flow.src_port),
        endpoint(flow.dst_pod.as_ref(), &flow.dst_ip, flow.dst_port),
        flow.protocol,
        flow.verdict
    )
}

pub fn flow_json(flow: &pb::Flow) -> Result<String, serde_json::Error> {
    serde_json::to_string(flow)
}

fn workload(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{name} ({namespace})")
    }
}

/// `frontend (default) -> catalog (default) [TCP] requests=3 ok=2 failed=1`
pub fn edge_text(edge: &pb::ServiceEdge) -> String {
    format!(
        "{} -> {} [{}] requests={} ok={} failed={}",
        workload(&edge.src_workload, &edge.src_namespace),
        workload(&edge.dst_workload, &edge.dst_namespace),
        edge.protocol,
        edge.request_count,
        edge.success_count,
        edge.failure_count
    )
}

pub fn edge_json(edge: &pb::ServiceEdge) -> Result<String, serde_json::Error> {
    serde_json::to_string(edge)
}
