pub mod distribution;
pub mod error;
pub mod flow;
pub mod grpc;
pub mod iface;
pub mod install;
pub mod k8s;
pub mod metrics;
pub mod runtime;
pub mod servicemap;
pub mod source;
