use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("ebpf program '{program}' not found in loaded object")]
    ProgramNotFound { program: &'static str },

    #[error("failed to {operation} ebpf program '{program}': {details}")]
    Program {
        operation: &'static str,
        program: &'static str,
        details: String,
    },

    #[error("failed to {operation} on interface {iface} ({direction}): {details}")]
    Tc {
        operation: &'static str,
        iface: String,
        direction: &'static str,
        details: String,
    },

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("invalid interface pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("no interfaces attached ({candidates} candidates)")]
    NoInterfacesAttached { candidates: usize },
}

impl IfaceError {
    pub fn program(operation: &'static str, program: &'static str, details: impl fmt::Display) -> Self {
        Self::Program {
            operation,
            program,
            details: details.to_string(),
        }
    }

    pub fn tc(
        operation: &'static str,
        iface: impl Into<String>,
        direction: &'static str,
        details: impl fmt::Display,
    ) -> Self {
        Self::Tc {
            operation,
            iface: iface.into(),
            direction,
            details: details.to_string(),
        }
    }

    pub fn netlink(details: impl fmt::Display) -> Self {
        Self::Netlink(details.to_string())
    }
}
