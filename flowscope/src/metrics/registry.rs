//! Global metrics registry and collector definitions.
//!
//! Every collector is created lazily and registered into [`REGISTRY`] by
//! [`init_registry`]. Collectors can be incremented before registration (tests do
//! this); they simply are not exported until registered.

use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

static INITIALIZED: Mutex<bool> = Mutex::new(false);

lazy_static! {
    /// Global Prometheus registry for all flowscope metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // eBPF Subsystem
    // ============================================================================

    /// Samples the classifier could not reserve in `FLOW_EVENTS`, summed over CPUs.
    pub static ref EBPF_EVENTS_LOST_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("events_lost_total", "Total number of flow records dropped in the kernel because the ring buffer was full")
            .namespace("flowscope")
            .subsystem("ebpf")
    ).expect("failed to create ebpf_events_lost_total metric");

    pub static ref EBPF_RINGBUF_RECORDS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("ringbuf_records_total", "Total number of records read from the FLOW_EVENTS ring buffer")
            .namespace("flowscope")
            .subsystem("ebpf")
    ).expect("failed to create ebpf_ringbuf_records_total metric");

    // ============================================================================
    // Ingest Subsystem
    // ============================================================================

    /// Labels: reason = "truncated" | "malformed"
    pub static ref INGEST_RECORDS_DISCARDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("records_discarded_total", "Total number of ring buffer records discarded during decode")
            .namespace("flowscope")
            .subsystem("ingest"),
        &["reason"]
    ).expect("failed to create ingest_records_discarded_total metric");

    pub static ref INGEST_HANDOFF_DROPPED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("handoff_dropped_total", "Total number of flow events dropped because the distribution handoff timed out")
            .namespace("flowscope")
            .subsystem("ingest")
    ).expect("failed to create ingest_handoff_dropped_total metric");

    pub static ref INGEST_READ_FAILURES_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("read_failures_total", "Total number of transient event channel read failures")
            .namespace("flowscope")
            .subsystem("ingest")
    ).expect("failed to create ingest_read_failures_total metric");

    pub static ref INGEST_EVENTS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("events_total", "Total number of flow events handed off to distribution")
            .namespace("flowscope")
            .subsystem("ingest")
    ).expect("failed to create ingest_events_total metric");

    // ============================================================================
    // K8s Subsystem
    // ============================================================================

    /// Labels: event = "apply" | "delete" | "init" | "init_done" | "error"
    pub static ref K8S_WATCHER_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watcher_events_total", "Total number of pod watcher events")
            .namespace("flowscope")
            .subsystem("k8s"),
        &["event"]
    ).expect("failed to create k8s_watcher_events_total metric");

    pub static ref K8S_CACHE_ENTRIES: IntGauge = IntGauge::with_opts(
        Opts::new("cache_entries", "Current number of addresses mapped to a workload")
            .namespace("flowscope")
            .subsystem("k8s")
    ).expect("failed to create k8s_cache_entries metric");

    /// Labels: result = "hit" | "miss"
    pub static ref K8S_CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups_total", "Total number of workload cache lookups")
            .namespace("flowscope")
            .subsystem("k8s"),
        &["result"]
    ).expect("failed to create k8s_cache_lookups_total metric");

    // ============================================================================
    // Distribution Subsystem
    // ============================================================================

    pub static ref DISTRIBUTION_DROPPED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("dropped_total", "Total number of flow events dropped because a subscriber queue was full")
            .namespace("flowscope")
            .subsystem("distribution")
    ).expect("failed to create distribution_dropped_total metric");

    pub static ref DISTRIBUTION_SUBSCRIBERS: IntGauge = IntGauge::with_opts(
        Opts::new("subscribers", "Current number of registered subscriptions")
            .namespace("flowscope")
            .subsystem("distribution")
    ).expect("failed to create distribution_subscribers metric");

    pub static ref DISTRIBUTION_PUBLISHED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("published_total", "Total number of flow events published to the hub")
            .namespace("flowscope")
            .subsystem("distribution")
    ).expect("failed to create distribution_published_total metric");

    // ============================================================================
    // Interface Subsystem
    // ============================================================================

    pub static ref IFACE_ATTACHED_LINKS: IntGauge = IntGauge::with_opts(
        Opts::new("attached_links", "Current number of TC links held by the agent")
            .namespace("flowscope")
            .subsystem("iface")
    ).expect("failed to create iface_attached_links metric");

    /// Labels: operation = "attach" | "detach", status = "ok" | "error"
    pub static ref IFACE_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("operations_total", "Total number of TC attach and detach operations")
            .namespace("flowscope")
            .subsystem("iface"),
        &["operation", "status"]
    ).expect("failed to create iface_operations_total metric");

    // ============================================================================
    // Task Subsystem
    // ============================================================================

    pub static ref TASKS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("active", "Current number of running agent tasks")
            .namespace("flowscope")
            .subsystem("tasks"),
        &["task"]
    ).expect("failed to create tasks_active metric");

    /// Labels: outcome = "completed" | "cancelled" | "panicked"
    pub static ref TASKS_FINISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("finished_total", "Total number of agent tasks that finished, by outcome")
            .namespace("flowscope")
            .subsystem("tasks"),
        &["task", "outcome"]
    ).expect("failed to create tasks_finished_total metric");

    pub static ref SHUTDOWN_TIMEOUTS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("shutdown_timeouts_total", "Total number of shutdowns that had to cancel tasks")
            .namespace("flowscope")
            .subsystem("tasks")
    ).expect("failed to create tasks_shutdown_timeouts_total metric");
}

macro_rules! register {
    ($metric:expr) => {
        REGISTRY.register(Box::new($metric.clone()))?
    };
}

/// Registers every collector into [`REGISTRY`]. Calling it again is a no-op.
///
/// # Errors
///
/// Returns [`prometheus::Error`] if a collector with the same name was already
/// registered by someone else.
pub fn init_registry() -> Result<(), prometheus::Error> {
    let mut initialized = INITIALIZED.lock().unwrap_or_else(PoisonError::into_inner);
    if *initialized {
        return Ok(());
    }

    register!(EBPF_EVENTS_LOST_TOTAL);
    register!(EBPF_RINGBUF_RECORDS_TOTAL);

    register!(INGEST_RECORDS_DISCARDED_TOTAL);
    register!(INGEST_HANDOFF_DROPPED_TOTAL);
    register!(INGEST_READ_FAILURES_TOTAL);
    register!(INGEST_EVENTS_TOTAL);

    register!(K8S_WATCHER_EVENTS_TOTAL);
    register!(K8S_CACHE_ENTRIES);
    register!(K8S_CACHE_LOOKUPS_TOTAL);

    register!(DISTRIBUTION_DROPPED_TOTAL);
    register!(DISTRIBUTION_SUBSCRIBERS);
    register!(DISTRIBUTION_PUBLISHED_TOTAL);

    register!(IFACE_ATTACHED_LINKS);
    register!(IFACE_OPERATIONS_TOTAL);

    register!(TASKS_ACTIVE);
    register!(TASKS_FINISHED_TOTAL);
    register!(SHUTDOWN_TIMEOUTS_TOTAL);

    *initialized = true;
    Ok(())
}
