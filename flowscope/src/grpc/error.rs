use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrpcError {
    #[error("invalid listen address '{address}'")]
    ListenAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind grpc server to {address}")]
    Bind {
        address: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid server endpoint '{endpoint}'")]
    Endpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("grpc transport error")]
    Transport(#[from] tonic::transport::Error),

    #[error("request failed: {0}")]
    Status(#[from] Box<tonic::Status>),

    #[error("failed to write output")]
    Output(#[from] io::Error),

    #[error("failed to encode output")]
    Json(#[from] serde_json::Error),
}

impl From<tonic::Status> for GrpcError {
    fn from(status: tonic::Status) -> Self {
        Self::Status(Box::new(status))
    }
}
