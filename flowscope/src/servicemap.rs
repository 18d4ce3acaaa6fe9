//! Workload-to-workload edges aggregated from the flow stream.

pub mod aggregator;

pub use aggregator::{EdgeCounts, EdgeKey, ServiceEdge, ServiceMapHandle, run_service_map};
