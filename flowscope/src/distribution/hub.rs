use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError};
use tracing::{debug, info, trace};

use crate::{distribution::FlowFilter, flow::FlowEvent, metrics::registry};

struct Subscription {
    filter: FlowFilter,
    tx: mpsc::Sender<Arc<FlowEvent>>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct HubInner {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HubInner {
    fn unregister(&self, id: u64) {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            registry::DISTRIBUTION_SUBSCRIBERS.dec();
            debug!(
                event.name = "distribution.unsubscribed",
                subscription.id = id,
                "subscription removed"
            );
        }
    }
}

/// Registry of live subscriptions. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct FlowHub {
    inner: Arc<HubInner>,
}

impl FlowHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription with its own queue of `capacity` events.
    /// After [`FlowHub::close_all`] the returned handle is already at end-of-stream.
    pub fn subscribe(&self, filter: FlowFilter, capacity: usize) -> SubscriptionHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscriptions = self
                .inner
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // checked under the lock so close_all cannot miss this subscription
            if !self.inner.closed.load(Ordering::Acquire) {
                debug!(
                    event.name = "distribution.subscribed",
                    subscription.id = id,
                    filter.namespace = ?filter.namespace,
                    filter.verdict = ?filter.verdict,
                    "subscription registered"
                );
                subscriptions.insert(
                    id,
                    Subscription {
                        filter,
                        tx,
                        dropped: Arc::clone(&dropped),
                    },
                );
                registry::DISTRIBUTION_SUBSCRIBERS.inc();
            }
        }

        SubscriptionHandle {
            id,
            rx,
            dropped,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Offers `event` to every matching subscription without waiting.
    pub fn publish(&self, event: &Arc<FlowEvent>) {
        registry::DISTRIBUTION_PUBLISHED_TOTAL.inc();
        let mut closed = Vec::new();

        {
            let subscriptions = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, subscription) in subscriptions.iter() {
                if !subscription.filter.matches(event) {
                    continue;
                }
                match subscription.tx.try_send(Arc::clone(event)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        subscription.dropped.fetch_add(1, Ordering::Relaxed);
                        registry::DISTRIBUTION_DROPPED_TOTAL.inc();
                        trace!(
                            event.name = "distribution.dropped",
                            subscription.id = id,
                            "subscriber queue full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            self.inner.unregister(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every subscription so each consumer sees end-of-stream once its
    /// queue is drained. Later subscriptions end immediately.
    pub fn close_all(&self) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.closed.store(true, Ordering::Release);
        let count = subscriptions.len();
        subscriptions.clear();
        registry::DISTRIBUTION_SUBSCRIBERS.sub(count as i64);
        info!(
            event.name = "distribution.closed",
            subscription.count = count,
            "all subscriptions closed"
        );
    }
}

/// Receiving side of a subscription. Dropping it unregisters the subscription.
pub struct SubscriptionHandle {
    id: u64,
    rx: mpsc::Receiver<Arc<FlowEvent>>,
    dropped: Arc<AtomicU64>,
    hub: Weak<HubInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the hub closed this subscription.
    pub async fn recv(&mut self) -> Option<Arc<FlowEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<FlowEvent>> {
        self.rx.try_recv().ok()
    }

    /// Events discarded because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for SubscriptionHandle {
    type Item = Arc<FlowEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(self.id);
        }
    }
}

/// Drains the ingestion handoff channel into `hub` until shutdown or until the
/// ingestion side goes away, then closes every subscription.
pub async fn run_distribution(
    mut rx: mpsc::Receiver<FlowEvent>,
    hub: FlowHub,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(
        event.name = "task.started",
        task.name = "distribution",
        "distribution task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = rx.recv() => match event {
                Some(event) => hub.publish(&Arc::new(event)),
                None => break,
            },
        }
    }

    hub.close_all();
    info!(
        event.name = "task.stopped",
        task.name = "distribution",
        "distribution task stopped"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::{
        distribution::filter::tests::{event, workload},
        flow::Verdict,
    };

    #[test]
    fn test_disjoint_filters_receive_only_matches() {
        let hub = FlowHub::new();
        let mut payments = hub.subscribe(FlowFilter::new("payments", ""), 16);
        let mut drops = hub.subscribe(FlowFilter::new("", "DROPPED"), 16);
        let mut all = hub.subscribe(FlowFilter::default(), 16);

        hub.publish(&Arc::new(event(
            Some(workload("api", "payments")),
            None,
            Verdict::Forwarded,
        )));
        hub.publish(&Arc::new(event(
            Some(workload("web", "default")),
            None,
            Verdict::Dropped,
        )));

        let got = payments.try_recv().expect("payments flow");
        assert_eq!(got.src_namespace(), Some("payments"));
        assert!(payments.try_recv().is_none());

        let got = drops.try_recv().expect("dropped flow");
        assert_eq!(got.verdict_label, "DROPPED");
        assert!(drops.try_recv().is_none());

        assert!(all.try_recv().is_some());
        assert!(all.try_recv().is_some());
        assert!(all.try_recv().is_none());
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_others() {
        let hub = FlowHub::new();
        let slow = hub.subscribe(FlowFilter::default(), 2);
        let mut fast = hub.subscribe(FlowFilter::default(), 64);

        for _ in 0..10 {
            hub.publish(&Arc::new(event(None, None, Verdict::Forwarded)));
            assert!(fast.try_recv().is_some());
        }

        assert_eq!(slow.dropped(), 8);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn test_publish_shares_one_allocation() {
        let hub = FlowHub::new();
        let mut a = hub.subscribe(FlowFilter::default(), 4);
        let mut b = hub.subscribe(FlowFilter::default(), 4);

        let ev = Arc::new(event(None, None, Verdict::Forwarded));
        hub.publish(&ev);

        assert!(Arc::ptr_eq(&a.try_recv().unwrap(), &ev));
        assert!(Arc::ptr_eq(&b.try_recv().unwrap(), &ev));
    }

    #[test]
    fn test_dropping_handle_unregisters() {
        let hub = FlowHub::new();
        let handle = hub.subscribe(FlowFilter::default(), 4);
        let _other = hub.subscribe(FlowFilter::default(), 4);
        assert_eq!(hub.subscriber_count(), 2);

        drop(handle);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_streams_after_drain() {
        let hub = FlowHub::new();
        let mut handle = hub.subscribe(FlowFilter::default(), 4);
        hub.publish(&Arc::new(event(None, None, Verdict::Forwarded)));

        hub.close_all();

        assert!(handle.next().await.is_some(), "queued event is still delivered");
        assert!(handle.next().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);

        let mut late = hub.subscribe(FlowFilter::default(), 4);
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_distribution_publishes_and_closes_on_shutdown() {
        let hub = FlowHub::new();
        let mut handle = hub.subscribe(FlowFilter::default(), 16);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_distribution(rx, hub.clone(), shutdown_rx));
        tx.send(event(None, None, Verdict::Forwarded)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), handle.recv())
            .await
            .expect("event should arrive");
        assert!(got.is_some());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_distribution_stops_when_ingestion_ends() {
        let hub = FlowHub::new();
        let mut handle = hub.subscribe(FlowFilter::default(), 16);
        let (tx, rx) = mpsc::channel::<FlowEvent>(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        drop(tx);
        run_distribution(rx, hub, shutdown_rx).await;
        assert!(handle.recv().await.is_none());
    }
}
