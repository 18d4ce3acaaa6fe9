use std::path::PathBuf;

use thiserror::Error;

use crate::{
    grpc::GrpcError,
    iface::IfaceError,
    install::InstallError,
    k8s::K8sError,
    metrics::error::MetricsError,
    runtime::conf::ConfError,
    source::{IngestError, ReadError},
};

/// Everything that can stop a flowscope command.
#[derive(Debug, Error)]
pub enum FlowscopeError {
    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error("failed to load eBPF object '{}': {source}", path.display())]
    EbpfLoad {
        path: PathBuf,
        #[source]
        source: Box<aya::EbpfError>,
    },

    #[error("event channel unavailable: {0}")]
    Source(#[from] ReadError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The event channel or the distribution handoff went away while the
    /// agent was not shutting down.
    #[error("{0} closed unexpectedly")]
    UnexpectedClose(&'static str),

    #[error(transparent)]
    Iface(#[from] IfaceError),

    #[error(transparent)]
    K8s(#[from] K8sError),

    #[error(transparent)]
    Grpc(#[from] GrpcError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("failed to register metrics: {0}")]
    Registry(#[from] prometheus::Error),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}
