//! Prometheus metrics collection and HTTP server.
//!
//! Collectors live in [`registry`] and are registered once at startup via
//! [`registry::init_registry`]. The agent serves them at `/metrics` through
//! [`server::start_metrics_server`].

pub mod error;
pub mod registry;
pub mod server;
