//! Attachment of the TC classifier to network interfaces.
//!
//! - `backend`: the [`backend::TcBackend`] seam and its aya implementation
//! - `discovery`: [`discovery::AttachPolicy`] and netlink link enumeration
//! - `netlink_monitor`: link events from `RTMGRP_LINK`
//! - `controller`: [`IfaceController`], attach/detach bookkeeping and
//!   reconciliation

pub mod backend;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod netlink_monitor;

pub use controller::IfaceController;
pub use error::IfaceError;
