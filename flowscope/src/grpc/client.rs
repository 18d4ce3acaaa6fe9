//! Client side used by the `observe` and `service-map` subcommands.

use std::{future::Future, io::Write};

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::{
    grpc::{
        GrpcError, format,
        pb::{self, flow_service_client::FlowServiceClient},
    },
    runtime::cli::OutputFormat,
};

pub async fn connect(server: &str) -> Result<FlowServiceClient<Channel>, GrpcError> {
    let endpoint = Endpoint::from_shared(server.to_string()).map_err(|source| {
        GrpcError::Endpoint {
            endpoint: server.to_string(),
            source,
        }
    })?;
    let channel = endpoint.connect().await?;
    debug!(
        event.name = "grpc.client.connected",
        server.address = %server,
        "connected to agent"
    );
    Ok(FlowServiceClient::new(channel))
}

/// Writes one line per flow to `out` until the server ends the stream or
/// `stop` resolves. Returns the number of flows written.
pub async fn stream_flows<W: Write>(
    client: &mut FlowServiceClient<Channel>,
    request: pb::GetFlowsRequest,
    output: OutputFormat,
    out: &mut W,
    stop: impl Future<Output = ()>,
) -> Result<u64, GrpcError> {
    let mut stream = client.get_flows(request).await?.into_inner();
    let mut written = 0;
    tokio::pin!(stop);

    loop {
        let flow = tokio::select! {
            _ = &mut stop => break,
            message = stream.message() => match message? {
                Some(flow) => flow,
                None => break,
            },
        };
        let line = match output {
            OutputFormat::Text => format::flow_text(&flow),
            OutputFormat::Json => format::flow_json(&flow)?,
        };
        writeln!(out, "{line}")?;
        out.flush()?;
        written += 1;
    }

    info!(
        event.name = "grpc.client.stream_ended",
        flows.received = written,
        "flow stream ended"
    );
    Ok(written)
}

/// Writes every edge of the agent's service map to `out`. Returns the number
/// of edges.
pub async fn print_service_map<W: Write>(
    client: &mut FlowServiceClient<Channel>,
    window_seconds: Option<u32>,
    output: OutputFormat,
    out: &mut W,
) -> Result<usize, GrpcError> {
    let map = client
        .get_service_map(pb::GetServiceMapRequest {
            window_seconds: window_seconds.unwrap_or(0),
        })
        .await?
        .into_inner();

    for edge in &map.edges {
        let line = match output {
            OutputFormat::Text => format::edge_text(edge),
            OutputFormat::Json => format::edge_json(edge)?,
        };
        writeln!(out, "{line}")?;
    }
    debug!(
        event.name = "grpc.client.service_map_received",
        edges = map.edges.len(),
        window_seconds = map.window_seconds,
        "service map received"
    );
    Ok(map.edges.len())
}
