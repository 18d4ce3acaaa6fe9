//! Server side of `flowscope.v1.FlowService`.

use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status, transport::Server};
use tracing::{debug, info};

use crate::{
    distribution::{FlowFilter, FlowHub},
    flow::{FlowEvent, VERDICT_DROPPED_LABEL, VERDICT_FORWARDED_LABEL},
    grpc::{
        GrpcError,
        pb::{self, flow_service_server::FlowService, flow_service_server::FlowServiceServer},
    },
    k8s::WorkloadInfo,
    runtime::conf::GrpcConf,
    servicemap::{ServiceEdge, ServiceMapHandle},
};

impl From<&WorkloadInfo> for pb::PodInfo {
    fn from(info: &WorkloadInfo) -> Self {
        Self {
            name: info.name.clone(),
            namespace: info.namespace.clone(),
            workload_name: info.workload_name.clone().unwrap_or_default(),
            workload_kind: info.workload_kind.clone().unwrap_or_default(),
            labels: info
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<&FlowEvent> for pb::Flow {
    fn from(event: &FlowEvent) -> Self {
        let key = &event.record.key;
        Self {
            src_ip: key.src.to_string(),
            dst_ip: key.dst.to_string(),
            src_port: key.src_port.into(),
            dst_port: key.dst_port.into(),
            protocol: event.protocol_label.to_string(),
            verdict: event.verdict_label.to_string(),
            timestamp_ns: event.record.timestamp_ns,
            tunneled: event.record.tunneled,
            src_pod: event.src_workload.as_deref().map(pb::PodInfo::from),
            dst_pod: event.dst_workload.as_deref().map(pb::PodInfo::from),
            failure_reason: event.failure_reason.clone().unwrap_or_default(),
        }
    }
}

impl From<&ServiceEdge> for pb::ServiceEdge {
    fn from(edge: &ServiceEdge) -> Self {
        Self {
            src_workload: edge.key.src_workload.clone(),
            src_namespace: edge.key.src_namespace.clone(),
            dst_workload: edge.key.dst_workload.clone(),
            dst_namespace: edge.key.dst_namespace.clone(),
            protocol: edge.key.protocol.clone(),
            request_count: edge.counts.requests,
            success_count: edge.counts.successes,
            failure_count: edge.counts.failures,
        }
    }
}

pub struct FlowServiceImpl {
    hub: FlowHub,
    subscriber_capacity: usize,
    service_map: Option<ServiceMapHandle>,
}

impl FlowServiceImpl {
    pub fn new(
        hub: FlowHub,
        subscriber_capacity: usize,
        service_map: Option<ServiceMapHandle>,
    ) -> Self {
        Self {
            hub,
            subscriber_capacity,
            service_map,
        }
    }
}

fn validate_verdict(verdict: &str) -> Result<(), Status> {
    if verdict.is_empty()
        || verdict.eq_ignore_ascii_case(VERDICT_FORWARDED_LABEL)
        || verdict.eq_ignore_ascii_case(VERDICT_DROPPED_LABEL)
    {
        Ok(())
    } else {
        Err(Status::invalid_argument(format!(
            "unknown verdict '{verdict}', expected {VERDICT_FORWARDED_LABEL} or {VERDICT_DROPPED_LABEL}"
        )))
    }
}

#[tonic::async_trait]
impl FlowService for FlowServiceImpl {
    type GetFlowsStream = Pin<Box<dyn Stream<Item = Result<pb::Flow, Status>> + Send>>;

    async fn get_flows(
        &self,
        request: Request<pb::GetFlowsRequest>,
    ) -> Result<Response<Self::GetFlowsStream>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        validate_verdict(&req.verdict)?;

        let subscription = self.hub.subscribe(
            FlowFilter::new(req.namespace, req.verdict),
            self.subscriber_capacity,
        );
        debug!(
            event.name = "grpc.get_flows.subscribed",
            subscription.id = subscription.id(),
            client.address = ?remote,
            "flow stream opened"
        );

        // dropping the stream drops the handle, which unregisters it
        let stream = subscription.map(|event| Ok(pb::Flow::from(event.as_ref())));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_service_map(
        &self,
        request: Request<pb::GetServiceMapRequest>,
    ) -> Result<Response<pb::ServiceMap>, Status> {
        let Some(service_map) = &self.service_map else {
            return Err(Status::unavailable("service map is disabled on this agent"));
        };
        let window_seconds = request.into_inner().window_seconds;
        let requested = Some(Duration::from_secs(window_seconds.into()));

        let (edges, window) = service_map.query(requested);
        Ok(Response::new(pb::ServiceMap {
            edges: edges.iter().map(pb::ServiceEdge::from).collect(),
            window_seconds: u32::try_from(window.as_secs()).unwrap_or(u32::MAX),
        }))
    }
}

pub fn listen_address(conf: &GrpcConf) -> Result<SocketAddr, GrpcError> {
    let ip: IpAddr = conf
        .listen_address
        .parse()
        .map_err(|source| GrpcError::ListenAddress {
            address: conf.listen_address.clone(),
            source,
        })?;
    Ok(SocketAddr::new(ip, conf.port))
}

/// Binds the configured address and serves until shutdown.
pub async fn start_grpc_server(
    conf: GrpcConf,
    service: FlowServiceImpl,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), GrpcError> {
    let listener = bind(&conf).await?;
    serve(listener, service, shutdown_rx).await
}

pub async fn bind(conf: &GrpcConf) -> Result<TcpListener, GrpcError> {
    let address = listen_address(conf)?;
    TcpListener::bind(address)
        .await
        .map_err(|source| GrpcError::Bind { address, source })
}

/// Serves on an already bound listener. Open flow streams end once the hub
/// closes its subscriptions.
pub async fn serve(
    listener: TcpListener,
    service: FlowServiceImpl,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), GrpcError> {
    info!(
        event.name = "grpc.server.started",
        net.listen.address = ?listener.local_addr().ok(),
        "grpc server listening"
    );

    Server::builder()
        .add_service(FlowServiceServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    info!(
        event.name = "grpc.server.stopped",
        "grpc server stopped"
    );
    Ok(())
}
