//! Error types for the metrics module.

use std::io;

use thiserror::Error;

/// Errors that can occur in the metrics system.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to bind to the configured address and port.
    #[error("failed to bind metrics server to {address}: {source}")]
    BindAddress {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("metrics server error: {0}")]
    Serve(#[from] io::Error),

    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl MetricsError {
    pub fn bind_address(address: impl Into<String>, source: io::Error) -> Self {
        Self::BindAddress {
            address: address.into(),
            source,
        }
    }
}
