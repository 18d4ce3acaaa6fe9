//! `flowscope.v1.FlowService`: the flow stream and service map over gRPC.

pub mod client;
pub mod error;
pub mod format;
pub mod service;

pub mod pb {
    tonic::include_proto!("flowscope.v1");
}

pub use error::GrpcError;
pub use service::{FlowServiceImpl, start_grpc_server};
