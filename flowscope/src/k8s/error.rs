use std::fmt;

use thiserror::Error;

/// Errors that can occur during Kubernetes operations
#[derive(Debug, Error)]
pub enum K8sError {
    /// Failed to create or initialize Kubernetes client
    #[error("failed to initialize Kubernetes client: {0}")]
    ClientInitialization(#[source] Box<kube::Error>),

    /// The pod watch stream failed; the watcher reconnects after a delay.
    #[error("pod watch stream failed: {details}")]
    WatchStream { details: String },
}

impl K8sError {
    pub fn client_initialization(source: kube::Error) -> Self {
        Self::ClientInitialization(Box::new(source))
    }

    pub fn watch_stream(details: impl fmt::Display) -> Self {
        Self::WatchStream {
            details: details.to_string(),
        }
    }
}
