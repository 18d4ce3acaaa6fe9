//! The ingestion loop: the single consumer of the event channel.

use std::{net::IpAddr, sync::Arc};

use tokio::{
    sync::{
        broadcast::{self, error::TryRecvError},
        mpsc::{self, error::SendTimeoutError},
    },
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    flow::FlowEvent,
    k8s::WorkloadCache,
    metrics::registry,
    runtime::conf::PipelineConf,
    source::{EventSource, IngestError, ReadError, backoff::Backoff, decode::decode_record},
};

/// Why the loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// The event channel reported it is closed.
    ChannelClosed,
    /// The distribution side dropped its receiver.
    HandoffClosed,
}

/// Counters for this loop instance. The process-wide equivalents are in the
/// metrics registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub records: u64,
    pub truncated: u64,
    pub malformed: u64,
    pub handed_off: u64,
    pub handoff_dropped: u64,
    pub lost: u64,
}

pub struct IngestionLoop<S: EventSource> {
    source: S,
    cache: Option<Arc<WorkloadCache>>,
    handoff: mpsc::Sender<FlowEvent>,
    conf: PipelineConf,
    shutdown_rx: broadcast::Receiver<()>,
    stats: IngestStats,
    last_lost: u64,
}

impl<S: EventSource> IngestionLoop<S> {
    pub fn new(
        source: S,
        cache: Option<Arc<WorkloadCache>>,
        handoff: mpsc::Sender<FlowEvent>,
        conf: PipelineConf,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            source,
            cache,
            handoff,
            conf,
            shutdown_rx,
            stats: IngestStats::default(),
            last_lost: 0,
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Reads until shutdown, channel close, or sustained read failure.
    ///
    /// Transient read failures back off (doubling from `backoff_initial` up to
    /// `backoff_max`); `max_consecutive_failures` in a row is fatal. Any
    /// successful read resets the schedule.
    pub async fn run(&mut self) -> Result<Exit, IngestError> {
        info!(
            event.name = "task.started",
            task.name = "ingestion_loop",
            "ingestion loop started"
        );

        let mut backoff = Backoff::new(self.conf.backoff_initial, self.conf.backoff_max);
        let mut loss_poll = tokio::time::interval_at(
            Instant::now() + self.conf.loss_poll_interval,
            self.conf.loss_poll_interval,
        );
        loss_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut batch: Vec<Vec<u8>> = Vec::new();

        loop {
            let result = tokio::select! {
                _ = self.shutdown_rx.recv() => return Ok(self.stopped(Exit::Shutdown)),
                _ = loss_poll.tick() => {
                    self.poll_lost_samples();
                    continue;
                }
                result = self.source.next_batch(&mut batch) => result,
            };

            match result {
                Ok(()) => {
                    backoff.reset();
                    for bytes in std::mem::take(&mut batch) {
                        if let Some(exit) = self.process(&bytes).await {
                            return Ok(self.stopped(exit));
                        }
                    }
                }
                Err(ReadError::Closed) => {
                    warn!(
                        event.name = "ingest.channel_closed",
                        "event channel closed, ingestion loop ending"
                    );
                    return Ok(self.stopped(Exit::ChannelClosed));
                }
                Err(e) => {
                    registry::INGEST_READ_FAILURES_TOTAL.inc();
                    let delay = backoff.fail();
                    if backoff.failures() >= self.conf.max_consecutive_failures {
                        return Err(IngestError::sustained(backoff.failures(), e));
                    }
                    warn!(
                        event.name = "ingest.read_failed",
                        error.message = %e,
                        ingest.consecutive_failures = backoff.failures(),
                        retry.delay = %humantime::format_duration(delay),
                        "event channel read failed, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => return Ok(self.stopped(Exit::Shutdown)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn stopped(&mut self, exit: Exit) -> Exit {
        self.poll_lost_samples();
        info!(
            event.name = "task.stopped",
            task.name = "ingestion_loop",
            ingest.exit = ?exit,
            ingest.records = self.stats.records,
            ingest.handoff_dropped = self.stats.handoff_dropped,
            "ingestion loop stopped"
        );
        exit
    }

    /// Decodes, enriches and hands off one record. Returns an exit reason when
    /// the loop must stop.
    async fn process(&mut self, bytes: &[u8]) -> Option<Exit> {
        match self.shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return Some(Exit::Shutdown),
        }

        self.stats.records += 1;
        let record = match decode_record(bytes) {
            Ok(record) => record,
            Err(e) => {
                match e.reason() {
                    "truncated" => self.stats.truncated += 1,
                    _ => self.stats.malformed += 1,
                }
                registry::INGEST_RECORDS_DISCARDED_TOTAL
                    .with_label_values(&[e.reason()])
                    .inc();
                warn!(
                    event.name = "ingest.record_discarded",
                    error.message = %e,
                    reason = e.reason(),
                    "discarding undecodable record"
                );
                return None;
            }
        };

        let (src, dst) = match &self.cache {
            Some(cache) => (
                cache.lookup(&IpAddr::V4(record.key.src)),
                cache.lookup(&IpAddr::V4(record.key.dst)),
            ),
            None => (None, None),
        };
        let event = FlowEvent::new(record, src, dst);
        trace!(
            event.name = "ingest.flow",
            flow.key = %event.record.key,
            flow.verdict = event.verdict_label,
            "flow observed"
        );

        match self
            .handoff
            .send_timeout(event, self.conf.handoff_timeout)
            .await
        {
            Ok(()) => {
                self.stats.handed_off += 1;
                registry::INGEST_EVENTS_TOTAL.inc();
                None
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.handoff_dropped += 1;
                registry::INGEST_HANDOFF_DROPPED_TOTAL.inc();
                debug!(
                    event.name = "ingest.handoff_dropped",
                    "distribution handoff full, dropping event"
                );
                None
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(
                    event.name = "ingest.handoff_closed",
                    "distribution channel closed, ingestion loop ending"
                );
                Some(Exit::HandoffClosed)
            }
        }
    }

    /// Reports growth of the kernel-side loss counter. Never an error.
    pub fn poll_lost_samples(&mut self) {
        match self.source.lost_samples() {
            Ok(total) => {
                let delta = total.saturating_sub(self.last_lost);
                self.last_lost = total;
                if delta > 0 {
                    self.stats.lost += delta;
                    registry::EBPF_EVENTS_LOST_TOTAL.inc_by(delta);
                    warn!(
                        event.name = "ebpf.samples_lost",
                        ebpf.samples_lost = delta,
                        ebpf.samples_lost_total = total,
                        "ring buffer full, samples lost in kernel"
                    );
                }
            }
            Err(e) => {
                debug!(
                    event.name = "ebpf.loss_counter_unreadable",
                    error.message = %e,
                    "failed to read lost sample counter"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{BTreeMap, VecDeque},
        net::Ipv4Addr,
        time::Duration,
    };

    use async_trait::async_trait;
    use flowscope_common::{RawFlowRecord, VERDICT_FORWARD};

    use super::*;
    use crate::k8s::{PodSnapshot, WatchEvent, WorkloadInfo};

    /// Replays a fixed script of read results, then either closes or hangs.
    pub struct ScriptedSource {
        pub script: VecDeque<Result<Vec<Vec<u8>>, ReadError>>,
        pub lost: u64,
        pub hang_when_done: bool,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<Result<Vec<Vec<u8>>, ReadError>>) -> Self {
            Self {
                script: script.into(),
                lost: 0,
                hang_when_done: false,
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_batch(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), ReadError> {
            match self.script.pop_front() {
                Some(Ok(records)) => {
                    out.extend(records);
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None if self.hang_when_done => futures::future::pending().await,
                None => Err(ReadError::Closed),
            }
        }

        fn lost_samples(&mut self) -> Result<u64, ReadError> {
            Ok(self.lost)
        }
    }

    pub fn record_bytes(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
        RawFlowRecord {
            src_addr: u32::from_be_bytes(src),
            dst_addr: u32::from_be_bytes(dst),
            src_port: sport,
            dst_port: dport,
            protocol: 6,
            verdict: VERDICT_FORWARD,
            flags: 0,
            _pad: 0,
            timestamp_ns: 99,
        }
        .to_le_bytes()
        .to_vec()
    }

    fn transient() -> Result<Vec<Vec<u8>>, ReadError> {
        Err(ReadError::transient("EAGAIN"))
    }

    fn ingestion(
        source: ScriptedSource,
        cache: Option<Arc<WorkloadCache>>,
        capacity: usize,
    ) -> (
        IngestionLoop<ScriptedSource>,
        mpsc::Receiver<FlowEvent>,
        broadcast::Sender<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let ingest = IngestionLoop::new(source, cache, tx, PipelineConf::default(), shutdown_rx);
        (ingest, rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_decodes_and_enriches_records() {
        let cache = Arc::new(WorkloadCache::new());
        cache.apply(WatchEvent::Upsert(PodSnapshot {
            info: WorkloadInfo {
                name: "frontend".to_string(),
                namespace: "default".to_string(),
                labels: BTreeMap::new(),
                ..Default::default()
            },
            ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
        }));
        let source = ScriptedSource::new(vec![Ok(vec![record_bytes(
            [10, 0, 0, 5],
            43210,
            [10, 0, 0, 9],
            80,
        )])]);
        let (mut ingest, mut rx, _shutdown) = ingestion(source, Some(cache), 8);

        let exit = ingest.run().await.unwrap();

        assert_eq!(exit, Exit::ChannelClosed);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.src_workload.as_ref().unwrap().name, "frontend");
        assert!(event.dst_workload.is_none());
        assert_eq!(event.protocol_label, "TCP");
        assert_eq!(ingest.stats().handed_off, 1);
    }

    #[tokio::test]
    async fn test_discards_truncated_and_malformed_records() {
        let mut malformed = record_bytes([10, 0, 0, 5], 1, [10, 0, 0, 9], 2);
        malformed[RawFlowRecord::VERDICT_OFFSET] = 0;
        let source = ScriptedSource::new(vec![Ok(vec![
            vec![0u8; 12],
            malformed,
            record_bytes([10, 0, 0, 5], 1, [10, 0, 0, 9], 2),
        ])]);
        let (mut ingest, mut rx, _shutdown) = ingestion(source, None, 8);

        ingest.run().await.unwrap();

        let stats = ingest.stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.truncated, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.handed_off, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_then_recovers() {
        let source = ScriptedSource::new(vec![
            transient(),
            transient(),
            transient(),
            transient(),
            Ok(vec![record_bytes([10, 0, 0, 5], 1, [10, 0, 0, 9], 2)]),
            transient(),
        ]);
        let (mut ingest, mut rx, _shutdown) = ingestion(source, None, 8);
        let start = Instant::now();

        let exit = ingest.run().await.unwrap();

        assert_eq!(exit, Exit::ChannelClosed);
        // 1s + 2s + 4s + 8s, then the success resets the schedule to 1s
        assert_eq!(start.elapsed(), Duration::from_secs(16));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_failure_is_fatal() {
        let source = ScriptedSource::new((0..5).map(|_| transient()).collect());
        let (mut ingest, _rx, _shutdown) = ingestion(source, None, 8);
        let start = Instant::now();

        let err = ingest.run().await.unwrap_err();

        let IngestError::Sustained { failures, .. } = err;
        assert_eq!(failures, 5);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_timeout_drops_event() {
        let records = (0..3)
            .map(|i| record_bytes([10, 0, 0, 5], i, [10, 0, 0, 9], 80))
            .collect();
        let source = ScriptedSource::new(vec![Ok(records)]);
        // capacity 1 and nobody draining: the 2nd and 3rd event time out
        let (mut ingest, mut rx, _shutdown) = ingestion(source, None, 1);
        let start = Instant::now();

        let exit = ingest.run().await.unwrap();

        assert_eq!(exit, Exit::ChannelClosed);
        assert_eq!(ingest.stats().handed_off, 1);
        assert_eq!(ingest.stats().handoff_dropped, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(rx.recv().await.unwrap().record.key.src_port, 0);
    }

    #[tokio::test]
    async fn test_closed_handoff_ends_loop() {
        let source = ScriptedSource::new(vec![Ok(vec![record_bytes(
            [10, 0, 0, 5],
            1,
            [10, 0, 0, 9],
            2,
        )])]);
        let (mut ingest, rx, _shutdown) = ingestion(source, None, 8);
        drop(rx);

        assert_eq!(ingest.run().await.unwrap(), Exit::HandoffClosed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_waiting_read() {
        let mut source = ScriptedSource::new(vec![]);
        source.hang_when_done = true;
        let (mut ingest, _rx, shutdown) = ingestion(source, None, 8);
        shutdown.send(()).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), ingest.run())
            .await
            .expect("shutdown should stop the loop");
        assert_eq!(exit.unwrap(), Exit::Shutdown);
    }

    #[tokio::test]
    async fn test_lost_samples_reported_as_delta() {
        let source = ScriptedSource::new(vec![]);
        let (mut ingest, _rx, _shutdown) = ingestion(source, None, 8);

        ingest.source.lost = 7;
        ingest.poll_lost_samples();
        assert_eq!(ingest.stats().lost, 7);

        ingest.poll_lost_samples();
        assert_eq!(ingest.stats().lost, 7, "unchanged counter adds nothing");

        ingest.source.lost = 10;
        ingest.poll_lost_samples();
        assert_eq!(ingest.stats().lost, 10);
    }
}
