use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info};

use crate::{
    distribution::{FlowFilter, FlowHub},
    flow::{FlowEvent, Verdict},
    k8s::WorkloadInfo,
    runtime::conf::ServiceMapConf,
};

/// Workload pair and protocol an edge is counted under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeKey {
    pub src_workload: String,
    pub src_namespace: String,
    pub dst_workload: String,
    pub dst_namespace: String,
    pub protocol: String,
}

impl EdgeKey {
    /// `None` unless both endpoints carry identity.
    pub fn from_event(event: &FlowEvent) -> Option<Self> {
        let src = event.src_workload.as_deref()?;
        let dst = event.dst_workload.as_deref()?;
        Some(Self {
            src_workload: workload_name(src).to_string(),
            src_namespace: src.namespace.clone(),
            dst_workload: workload_name(dst).to_string(),
            dst_namespace: dst.namespace.clone(),
            protocol: event.protocol_label.to_string(),
        })
    }
}

fn workload_name(info: &WorkloadInfo) -> &str {
    info.workload_name.as_deref().unwrap_or(&info.name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EdgeCounts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

impl EdgeCounts {
    fn add(&mut self, other: &EdgeCounts) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEdge {
    #[serde(flatten)]
    pub key: EdgeKey,
    #[serde(flatten)]
    pub counts: EdgeCounts,
}

/// Edge counts in one-second buckets, oldest first.
#[derive(Debug)]
pub struct ServiceMapAggregator {
    buckets: VecDeque<(u64, BTreeMap<EdgeKey, EdgeCounts>)>,
    retention_secs: u64,
}

impl ServiceMapAggregator {
    pub fn new(retention: Duration) -> Self {
        Self {
            buckets: VecDeque::new(),
            retention_secs: retention.as_secs().max(1),
        }
    }

    /// Counts `event` in the bucket for second `now`. Events without identity
    /// on both ends are ignored.
    pub fn record(&mut self, event: &FlowEvent, now: u64) {
        let Some(key) = EdgeKey::from_event(event) else {
            return;
        };

        if self.buckets.back().is_none_or(|(second, _)| *second != now) {
            self.buckets.push_back((now, BTreeMap::new()));
        }
        self.prune(now);

        if let Some((_, edges)) = self.buckets.back_mut() {
            let counts = edges.entry(key).or_default();
            counts.requests += 1;
            match event.record.verdict {
                Verdict::Forwarded => counts.successes += 1,
                Verdict::Dropped => counts.failures += 1,
            }
        }
    }

    /// Edges seen during the `window_secs` seconds ending at `now`, sorted by
    /// key.
    pub fn edges(&self, window_secs: u64, now: u64) -> Vec<ServiceEdge> {
        let oldest = now.saturating_sub(window_secs.saturating_sub(1));
        let mut merged: BTreeMap<&EdgeKey, EdgeCounts> = BTreeMap::new();

        for (_, edges) in self
            .buckets
            .iter()
            .filter(|(second, _)| *second >= oldest && *second <= now)
        {
            for (key, counts) in edges {
                merged.entry(key).or_default().add(counts);
            }
        }

        merged
            .into_iter()
            .map(|(key, counts)| ServiceEdge {
                key: key.clone(),
                counts,
            })
            .collect()
    }

    fn prune(&mut self, now: u64) {
        let oldest = now.saturating_sub(self.retention_secs);
        while self
            .buckets
            .front()
            .is_some_and(|(second, _)| *second < oldest)
        {
            self.buckets.pop_front();
        }
    }
}

/// Shared access to the aggregator on a monotonic clock.
#[derive(Clone)]
pub struct ServiceMapHandle {
    inner: Arc<Mutex<ServiceMapAggregator>>,
    epoch: Instant,
    default_window: Duration,
    retention: Duration,
}

impl ServiceMapHandle {
    pub fn new(conf: &ServiceMapConf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceMapAggregator::new(conf.retention))),
            epoch: Instant::now(),
            default_window: conf.default_window,
            retention: conf.retention,
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    pub fn record(&self, event: &FlowEvent) {
        let now = self.now();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event, now);
    }

    /// Resolves the requested window: `None` or zero means the default, and
    /// nothing longer than the retention is kept.
    pub fn effective_window(&self, requested: Option<Duration>) -> Duration {
        let window = requested
            .filter(|w| !w.is_zero())
            .unwrap_or(self.default_window);
        window.clamp(Duration::from_secs(1), self.retention.max(Duration::from_secs(1)))
    }

    /// Edges over the trailing window, along with the window applied.
    pub fn query(&self, requested: Option<Duration>) -> (Vec<ServiceEdge>, Duration) {
        let window = self.effective_window(requested);
        let now = self.now();
        let edges = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .edges(window.as_secs(), now);
        (edges, window)
    }
}

/// Feeds every published flow into `handle` until shutdown.
pub async fn run_service_map(
    hub: FlowHub,
    handle: ServiceMapHandle,
    capacity: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut subscription = hub.subscribe(FlowFilter::default(), capacity);
    info!(
        event.name = "task.started",
        task.name = "service_map",
        subscription.id = subscription.id(),
        "service map aggregator started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = subscription.recv() => match event {
                Some(event) => handle.record(&event),
                None => {
                    debug!(
                        event.name = "service_map.subscription_closed",
                        "flow subscription closed"
                    );
                    break;
                }
            },
        }
    }

    info!(
        event.name = "task.stopped",
        task.name = "service_map",
        flows.dropped = subscription.dropped(),
        "service map aggregator stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::filter::tests::{event, workload};

    fn flow(src: &str, dst: &str, verdict: Verdict) -> FlowEvent {
        event(
            Some(workload(src, "default")),
            Some(workload(dst, "default")),
            verdict,
        )
    }

    #[test]
    fn test_counts_requests_successes_and_failures() {
        let mut agg = ServiceMapAggregator::new(Duration::from_secs(900));
        agg.record(&flow("frontend", "catalog", Verdict::Forwarded), 10);
        agg.record(&flow("frontend", "catalog", Verdict::Forwarded), 10);
        agg.record(&flow("frontend", "catalog", Verdict::Dropped), 11);

        let edges = agg.edges(60, 11);

        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key.src_workload, "frontend");
        assert_eq!(edges[0].key.dst_workload, "catalog");
        assert_eq!(edges[0].key.protocol, "TCP");
        assert_eq!(
            edges[0].counts,
            EdgeCounts {
                requests: 3,
                successes: 2,
                failures: 1,
            }
        );
    }

    #[test]
    fn test_window_excludes_older_buckets() {
        let mut agg = ServiceMapAggregator::new(Duration::from_secs(900));
        agg.record(&flow("frontend", "catalog", Verdict::Forwarded), 100);
        agg.record(&flow("frontend", "cart", Verdict::Forwarded), 150);
        agg.record(&flow("frontend", "cart", Verdict::Forwarded), 159);

        let recent = agg.edges(5, 159);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].key.dst_workload, "cart");
        assert_eq!(recent[0].counts.requests, 1);

        let wide = agg.edges(60, 159);
        assert_eq!(wide.len(), 2);
        assert_eq!(wide[0].key.dst_workload, "cart");
        assert_eq!(wide[0].counts.requests, 2);
        assert_eq!(wide[1].key.dst_workload, "catalog");
    }

    #[test]
    fn test_flows_without_identity_are_ignored() {
        let mut agg = ServiceMapAggregator::new(Duration::from_secs(900));
        agg.record(&event(Some(workload("frontend", "default")), None, Verdict::Forwarded), 1);
        agg.record(&event(None, None, Verdict::Forwarded), 1);

        assert!(agg.edges(60, 1).is_empty());
    }

    #[test]
    fn test_workload_name_preferred_over_pod_name() {
        let mut src = (*workload("frontend-7d9f-abcde", "default")).clone();
        src.workload_name = Some("frontend".to_string());
        let ev = event(
            Some(Arc::new(src)),
            Some(workload("catalog", "shop")),
            Verdict::Forwarded,
        );

        let key = EdgeKey::from_event(&ev).unwrap();
        assert_eq!(key.src_workload, "frontend");
        assert_eq!(key.dst_namespace, "shop");
    }

    #[test]
    fn test_retention_prunes_old_buckets() {
        let mut agg = ServiceMapAggregator::new(Duration::from_secs(30));
        agg.record(&flow("a", "b", Verdict::Forwarded), 0);
        agg.record(&flow("a", "c", Verdict::Forwarded), 100);

        assert_eq!(agg.buckets.len(), 1);
        assert_eq!(agg.edges(1000, 100).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_clamps_window() {
        let handle = ServiceMapHandle::new(&ServiceMapConf {
            enabled: true,
            default_window: Duration::from_secs(60),
            retention: Duration::from_secs(900),
        });

        assert_eq!(handle.effective_window(None), Duration::from_secs(60));
        assert_eq!(
            handle.effective_window(Some(Duration::ZERO)),
            Duration::from_secs(60)
        );
        assert_eq!(
            handle.effective_window(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            handle.effective_window(Some(Duration::from_secs(3600))),
            Duration::from_secs(900)
        );

        handle.record(&flow("frontend", "catalog", Verdict::Forwarded));
        tokio::time::advance(Duration::from_secs(30)).await;
        let (edges, window) = handle.query(Some(Duration::from_secs(10)));
        assert!(edges.is_empty());
        assert_eq!(window, Duration::from_secs(10));
        assert_eq!(handle.query(None).0.len(), 1);
    }

    #[tokio::test]
    async fn test_run_service_map_records_published_flows() {
        let hub = FlowHub::new();
        let handle = ServiceMapHandle::new(&ServiceMapConf::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_service_map(hub.clone(), handle.clone(), 16, shutdown_rx));
        while hub.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        hub.publish(&Arc::new(flow("frontend", "catalog", Verdict::Forwarded)));
        hub.close_all();
        task.await.unwrap();
        drop(shutdown_tx);

        let (edges, _) = handle.query(None);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].counts.requests, 1);
    }
}
