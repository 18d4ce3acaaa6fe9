//! Fan-out of enriched flow events to independently filtered subscribers.
//!
//! Every subscriber owns a bounded queue. A slow subscriber loses events from
//! its own queue only; publishing never waits.

pub mod filter;
pub mod hub;

pub use filter::FlowFilter;
pub use hub::{FlowHub, SubscriptionHandle, run_distribution};
