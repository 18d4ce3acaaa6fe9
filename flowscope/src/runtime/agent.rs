//! The `agent` subcommand: load the classifier, attach it, and run the
//! pipeline until a signal or a fatal error.

use std::sync::Arc;

use aya::Ebpf;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{Mutex, broadcast, mpsc},
};
use tracing::{debug, error, info, warn};

use crate::{
    distribution::{FlowHub, run_distribution},
    error::FlowscopeError,
    grpc::{FlowServiceImpl, service},
    iface::{
        IfaceController,
        backend::AyaTcBackend,
        controller::run_reconciliation,
        discovery::{AttachPolicy, candidate_links},
        netlink_monitor::spawn_link_monitor,
    },
    k8s::{WorkloadCache, watcher},
    metrics::{registry::init_registry, server::start_metrics_server},
    runtime::{conf::Conf, tasks::TaskSet},
    servicemap::{ServiceMapHandle, run_service_map},
    source::{
        ingest::{Exit, IngestionLoop},
        ringbuf::RingBufSource,
    },
};

/// Runs the node agent. Returns once every TC link is detached.
///
/// # Errors
///
/// Startup failures (object load, zero attached interfaces, gRPC bind) and
/// fatal pipeline errors (sustained read failure, unexpected channel close).
pub async fn run_agent(conf: Conf) -> Result<(), FlowscopeError> {
    init_registry()?;
    raise_memlock_rlimit();

    let mut ebpf = Ebpf::load_file(&conf.ebpf_object_path).map_err(|source| {
        FlowscopeError::EbpfLoad {
            path: conf.ebpf_object_path.clone(),
            source: Box::new(source),
        }
    })?;
    info!(
        event.name = "ebpf.loaded",
        ebpf.object.path = %conf.ebpf_object_path.display(),
        "eBPF object loaded"
    );
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        // the classifier may have been built without log statements
        warn!(
            event.name = "ebpf.logger_unavailable",
            error.message = %e,
            "failed to initialize eBPF logger"
        );
    }

    let source = RingBufSource::from_ebpf(&mut ebpf)?;

    // the backend owns the object from here on; dropping it unloads the programs
    let policy = AttachPolicy::from_conf(&conf.attach)?;
    let candidates = candidate_links(&policy)?;
    let mut controller = IfaceController::new(AyaTcBackend::new(ebpf)?, policy);
    controller.initialize(&candidates)?;
    let controller = Arc::new(Mutex::new(controller));

    let mut tasks = TaskSet::new();
    let outcome = run_pipeline(&conf, source, &controller, &mut tasks).await;

    let report = tasks.shutdown(conf.shutdown_timeout).await;
    info!(
        event.name = "tasks.shutdown_completed",
        tasks.completed = report.completed,
        tasks.cancelled = report.cancelled,
        tasks.panicked = report.panicked,
        "background tasks stopped"
    );

    let detached = match tokio::time::timeout(conf.shutdown_timeout, controller.lock()).await {
        Ok(mut controller) => controller.shutdown(),
        Err(_) => {
            error!(
                event.name = "iface.shutdown_timeout",
                "interface controller still busy, links left to the kernel"
            );
            0
        }
    };
    drop(controller);
    info!(
        event.name = "agent.stopped",
        tc_links.detached = detached,
        "agent stopped"
    );

    outcome
}

/// Spawns every background task and drives the ingestion loop on the current
/// task. Returns when the loop ends.
async fn run_pipeline(
    conf: &Conf,
    source: RingBufSource,
    controller: &Arc<Mutex<IfaceController<AyaTcBackend>>>,
    tasks: &mut TaskSet,
) -> Result<(), FlowscopeError> {
    // subscribed before anything can broadcast
    let ingest_shutdown_rx = tasks.subscribe();
    let shutdown_tx = tasks.shutdown_sender();
    tasks.spawn_with_shutdown("signals", move |shutdown_rx| {
        forward_signals(shutdown_tx, shutdown_rx)
    });

    // bound up front so a taken port fails startup
    let grpc_listener = service::bind(&conf.grpc).await?;

    let cache = start_workload_watch(conf, tasks).await;

    let hub = FlowHub::new();
    let (handoff_tx, handoff_rx) = mpsc::channel(conf.pipeline.handoff_capacity);
    {
        let hub = hub.clone();
        tasks.spawn_with_shutdown("distribution", move |shutdown_rx| {
            run_distribution(handoff_rx, hub, shutdown_rx)
        });
    }

    let service_map = conf.servicemap.enabled.then(|| ServiceMapHandle::new(&conf.servicemap));
    if let Some(handle) = &service_map {
        let hub = hub.clone();
        let handle = handle.clone();
        let capacity = conf.distribution.subscriber_capacity;
        tasks.spawn_with_shutdown("service_map", move |shutdown_rx| {
            run_service_map(hub, handle, capacity, shutdown_rx)
        });
    }

    let flow_service = FlowServiceImpl::new(
        hub.clone(),
        conf.distribution.subscriber_capacity,
        service_map,
    );
    tasks.spawn_with_shutdown("grpc_server", move |shutdown_rx| async move {
        if let Err(e) = service::serve(grpc_listener, flow_service, shutdown_rx).await {
            error!(
                event.name = "grpc.server.failed",
                error.message = %e,
                "grpc server stopped with an error"
            );
        }
    });

    let metrics_conf = conf.metrics.clone();
    tasks.spawn_with_shutdown("metrics_server", move |shutdown_rx| async move {
        if let Err(e) = start_metrics_server(metrics_conf, shutdown_rx).await {
            error!(
                event.name = "metrics.server_failed",
                error.message = %e,
                "metrics server stopped with an error"
            );
        }
    });

    let is_discover = controller.lock().await.policy().is_discover();
    if is_discover {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        // the thread exits on its own once the receiver is gone
        let _monitor = spawn_link_monitor(changes_tx)?;
        let controller = controller.clone();
        tasks.spawn_with_shutdown("iface_reconciliation", move |shutdown_rx| {
            run_reconciliation(controller, changes_rx, shutdown_rx)
        });
    }

    let mut ingestion = IngestionLoop::new(
        source,
        cache,
        handoff_tx,
        conf.pipeline.clone(),
        ingest_shutdown_rx,
    );
    info!(
        event.name = "agent.started",
        tasks = tasks.len(),
        "agent running, waiting for flows"
    );
    match ingestion.run().await? {
        Exit::Shutdown => Ok(()),
        Exit::ChannelClosed => Err(FlowscopeError::UnexpectedClose("event channel")),
        Exit::HandoffClosed => Err(FlowscopeError::UnexpectedClose("distribution handoff")),
    }
}

/// Starts the pod watch when enabled. Returns `None` when correlation is off,
/// in which case flows carry no workload identity.
async fn start_workload_watch(conf: &Conf, tasks: &mut TaskSet) -> Option<Arc<WorkloadCache>> {
    if !conf.kubernetes.enabled {
        info!(
            event.name = "k8s.disabled",
            "kubernetes correlation disabled in configuration"
        );
        return None;
    }

    let client = match watcher::connect().await {
        Ok(client) => client,
        Err(e) => {
            warn!(
                event.name = "k8s.unavailable",
                error.message = %e,
                "no cluster reachable, running without workload correlation"
            );
            return None;
        }
    };

    let cache = Arc::new(WorkloadCache::new());
    let reconnect_delay = conf.kubernetes.watch_reconnect_delay;
    {
        let cache = cache.clone();
        tasks.spawn_with_shutdown("pod_watcher", move |shutdown_rx| {
            watcher::run_pod_watcher(client, cache, reconnect_delay, shutdown_rx)
        });
    }
    Some(cache)
}

/// Turns the first SIGINT or SIGTERM into the shutdown broadcast.
async fn forward_signals(
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!(
                    event.name = "agent.signal_listener_failed",
                    error.message = %e,
                    "failed to install signal handlers"
                );
                return;
            }
        };

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = shutdown_rx.recv() => return,
    };
    info!(
        event.name = "agent.signal_received",
        signal.name = name,
        "shutting down"
    );
    let _ = shutdown_tx.send(());
}

/// Older kernels charge BPF maps against `RLIMIT_MEMLOCK`.
fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!(
            event.name = "agent.memlock_unchanged",
            ret,
            "removing the locked memory limit failed"
        );
    }
}
