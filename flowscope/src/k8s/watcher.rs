//! Pod watch consumer feeding the [`WorkloadCache`].

use std::{fmt::Display, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::watcher;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::{
    k8s::{K8sError, PodSnapshot, WatchEvent, WorkloadCache},
    metrics::registry,
};

/// Why [`consume_watch_stream`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Shutdown,
    /// The stream ended or failed; reconnect.
    Disconnected,
}

/// Connects with the in-cluster or kubeconfig credentials.
pub async fn connect() -> Result<Client, K8sError> {
    Client::try_default()
        .await
        .map_err(K8sError::client_initialization)
}

/// Watches every pod in the cluster and applies the changes to `cache` until
/// shutdown. Stream failures are logged and the watch is re-established after
/// `reconnect_delay`; the reconnect relists and resyncs the cache.
pub async fn run_pod_watcher(
    client: Client,
    cache: Arc<WorkloadCache>,
    reconnect_delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let api = Api::<Pod>::all(client);

    loop {
        debug!(
            event.name = "k8s.watcher.starting",
            k8s.resource.name = "Pod",
            "starting pod watcher"
        );
        let stream = watcher(api.clone(), watcher::Config::default()).boxed();

        if consume_watch_stream(stream, &cache, &mut shutdown_rx).await == WatchOutcome::Shutdown {
            break;
        }

        warn!(
            event.name = "k8s.watcher.reconnecting",
            k8s.resource.name = "Pod",
            retry.delay = %humantime::format_duration(reconnect_delay),
            "pod watcher disconnected, reconnecting"
        );
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    info!(
        event.name = "task.stopped",
        task.name = "k8s_pod_watcher",
        "pod watcher stopped"
    );
}

/// Drains one watch stream into the cache. Objects delivered between `Init`
/// and `InitDone` are collected and applied as a single resync.
pub async fn consume_watch_stream<S, E>(
    mut stream: S,
    cache: &WorkloadCache,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> WatchOutcome
where
    S: Stream<Item = Result<watcher::Event<Pod>, E>> + Unpin,
    E: Display,
{
    let mut initial: Option<Vec<PodSnapshot>> = None;

    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => return WatchOutcome::Shutdown,
            event = stream.next() => event,
        };

        match event {
            None => return WatchOutcome::Disconnected,
            Some(Ok(watcher::Event::Apply(pod))) => {
                registry::K8S_WATCHER_EVENTS_TOTAL
                    .with_label_values(&["apply"])
                    .inc();
                let snapshot = PodSnapshot::from_pod(&pod);
                trace!(
                    event.name = "k8s.watcher.apply",
                    k8s.pod.name = %snapshot.key(),
                    k8s.pod.ip = ?snapshot.ip,
                    "pod applied"
                );
                cache.apply(WatchEvent::Upsert(snapshot));
            }
            Some(Ok(watcher::Event::Delete(pod))) => {
                registry::K8S_WATCHER_EVENTS_TOTAL
                    .with_label_values(&["delete"])
                    .inc();
                let snapshot = PodSnapshot::from_pod(&pod);
                trace!(
                    event.name = "k8s.watcher.delete",
                    k8s.pod.name = %snapshot.key(),
                    "pod deleted"
                );
                cache.apply(WatchEvent::Delete(snapshot));
            }
            Some(Ok(watcher::Event::Init)) => {
                registry::K8S_WATCHER_EVENTS_TOTAL
                    .with_label_values(&["init"])
                    .inc();
                debug!(
                    event.name = "k8s.watcher.init",
                    k8s.resource.name = "Pod",
                    "pod watcher initialization started"
                );
                initial = Some(Vec::new());
            }
            Some(Ok(watcher::Event::InitApply(pod))) => {
                let snapshot = PodSnapshot::from_pod(&pod);
                match initial.as_mut() {
                    Some(buffer) => buffer.push(snapshot),
                    None => cache.apply(WatchEvent::Upsert(snapshot)),
                }
            }
            Some(Ok(watcher::Event::InitDone)) => {
                registry::K8S_WATCHER_EVENTS_TOTAL
                    .with_label_values(&["init_done"])
                    .inc();
                let snapshots = initial.take().unwrap_or_default();
                debug!(
                    event.name = "k8s.watcher.init_done",
                    k8s.resource.name = "Pod",
                    k8s.pod.count = snapshots.len(),
                    "pod watcher initialization complete, resyncing cache"
                );
                cache.apply(WatchEvent::Restarted(snapshots));
            }
            Some(Err(e)) => {
                registry::K8S_WATCHER_EVENTS_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                error!(
                    event.name = "k8s.watcher.error",
                    error.message = %e,
                    k8s.resource.name = "Pod",
                    "pod watcher error, will retry"
                );
                return WatchOutcome::Disconnected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use futures::stream;

    use super::*;
    use crate::k8s::test_pods::create_test_pod;

    type Item = Result<watcher::Event<Pod>, String>;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_apply_and_delete_events_update_cache() {
        let cache = WorkloadCache::new();
        let (_tx, mut rx) = broadcast::channel(1);
        let events: Vec<Item> = vec![
            Ok(watcher::Event::Apply(create_test_pod("frontend", "default", Some("10.0.0.5")))),
            Ok(watcher::Event::Apply(create_test_pod("catalog", "default", Some("10.0.0.9")))),
            Ok(watcher::Event::Delete(create_test_pod("catalog", "default", Some("10.0.0.9")))),
        ];

        let outcome = consume_watch_stream(stream::iter(events), &cache, &mut rx).await;

        assert_eq!(outcome, WatchOutcome::Disconnected);
        assert_eq!(cache.lookup(&ip(5)).unwrap().name, "frontend");
        assert!(cache.lookup(&ip(9)).is_none());
    }

    #[tokio::test]
    async fn test_initial_listing_resyncs_cache() {
        let cache = WorkloadCache::new();
        cache.apply(WatchEvent::Upsert(PodSnapshot::from_pod(&create_test_pod(
            "stale",
            "default",
            Some("10.0.0.1"),
        ))));
        let (_tx, mut rx) = broadcast::channel(1);
        let events: Vec<Item> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(create_test_pod("frontend", "default", Some("10.0.0.5")))),
            Ok(watcher::Event::InitDone),
        ];

        consume_watch_stream(stream::iter(events), &cache, &mut rx).await;

        assert!(cache.lookup(&ip(1)).is_none(), "missed deletion should be pruned");
        assert_eq!(cache.lookup(&ip(5)).unwrap().name, "frontend");
    }

    #[tokio::test]
    async fn test_stream_error_disconnects() {
        let cache = WorkloadCache::new();
        let (_tx, mut rx) = broadcast::channel(1);
        let events: Vec<Item> = vec![
            Err("connection reset".to_string()),
            Ok(watcher::Event::Apply(create_test_pod("frontend", "default", Some("10.0.0.5")))),
        ];

        let outcome = consume_watch_stream(stream::iter(events), &cache, &mut rx).await;

        assert_eq!(outcome, WatchOutcome::Disconnected);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let cache = WorkloadCache::new();
        let (tx, mut rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        let outcome = consume_watch_stream(stream::pending::<Item>(), &cache, &mut rx).await;

        assert_eq!(outcome, WatchOutcome::Shutdown);
    }
}
