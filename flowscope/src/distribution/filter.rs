use crate::flow::FlowEvent;

/// Per-subscription predicate. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFilter {
    /// Matches when either endpoint's pod lives in this namespace.
    pub namespace: Option<String>,
    /// Matches the verdict label, e.g. `FORWARDED`.
    pub verdict: Option<String>,
}

impl FlowFilter {
    /// Builds a filter from request strings; an empty string means "any".
    pub fn new(namespace: impl Into<String>, verdict: impl Into<String>) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        Self {
            namespace: non_empty(namespace.into()),
            verdict: non_empty(verdict.into()),
        }
    }

    pub fn matches(&self, event: &FlowEvent) -> bool {
        if let Some(namespace) = &self.namespace {
            let in_namespace = event.src_namespace() == Some(namespace.as_str())
                || event.dst_namespace() == Some(namespace.as_str());
            if !in_namespace {
                return false;
            }
        }
        if let Some(verdict) = &self.verdict {
            if !event.verdict_label.eq_ignore_ascii_case(verdict) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
    };

    use super::*;
    use crate::{
        flow::{FlowKey, FlowRecord, Verdict},
        k8s::WorkloadInfo,
    };

    pub fn workload(name: &str, namespace: &str) -> Arc<WorkloadInfo> {
        Arc::new(WorkloadInfo {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        })
    }

    pub fn event(
        src: Option<Arc<WorkloadInfo>>,
        dst: Option<Arc<WorkloadInfo>>,
        verdict: Verdict,
    ) -> FlowEvent {
        FlowEvent::new(
            FlowRecord {
                key: FlowKey {
                    src: Ipv4Addr::new(10, 0, 0, 5),
                    dst: Ipv4Addr::new(10, 0, 0, 9),
                    src_port: 43210,
                    dst_port: 80,
                    protocol: 6,
                },
                verdict,
                timestamp_ns: 1,
                tunneled: false,
            },
            src,
            dst,
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = FlowFilter::new("", "");
        assert_eq!(filter, FlowFilter::default());
        assert!(filter.matches(&event(None, None, Verdict::Forwarded)));
        assert!(filter.matches(&event(None, None, Verdict::Dropped)));
    }

    #[test]
    fn test_namespace_matches_either_endpoint() {
        let filter = FlowFilter::new("payments", "");

        let from = event(Some(workload("api", "payments")), None, Verdict::Forwarded);
        let to = event(None, Some(workload("db", "payments")), Verdict::Forwarded);
        let other = event(
            Some(workload("web", "default")),
            Some(workload("cache", "default")),
            Verdict::Forwarded,
        );
        let anonymous = event(None, None, Verdict::Forwarded);

        assert!(filter.matches(&from));
        assert!(filter.matches(&to));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&anonymous));
    }

    #[test]
    fn test_verdict_filter() {
        let filter = FlowFilter::new("", "DROPPED");
        assert!(filter.matches(&event(None, None, Verdict::Dropped)));
        assert!(!filter.matches(&event(None, None, Verdict::Forwarded)));

        let lowercase = FlowFilter::new("", "dropped");
        assert!(lowercase.matches(&event(None, None, Verdict::Dropped)));
    }

    #[test]
    fn test_filters_combine() {
        let filter = FlowFilter::new("default", "FORWARDED");
        assert!(filter.matches(&event(Some(workload("a", "default")), None, Verdict::Forwarded)));
        assert!(!filter.matches(&event(Some(workload("a", "default")), None, Verdict::Dropped)));
        assert!(!filter.matches(&event(Some(workload("a", "other")), None, Verdict::Forwarded)));
    }

    #[test]
    fn test_ip_addr_is_not_a_namespace() {
        let filter = FlowFilter::new("10.0.0.5", "");
        let ev = event(None, None, Verdict::Forwarded);
        assert_eq!(IpAddr::V4(ev.record.key.src).to_string(), "10.0.0.5");
        assert!(!filter.matches(&ev));
    }
}
