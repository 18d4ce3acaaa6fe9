use std::fmt;

use thiserror::Error;

/// Failure reading from the event channel.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Retry with backoff.
    #[error("transient event channel read failure: {0}")]
    Transient(String),

    /// The channel is gone; no further records will arrive.
    #[error("event channel closed")]
    Closed,
}

impl ReadError {
    pub fn transient(details: impl fmt::Display) -> Self {
        Self::Transient(details.to_string())
    }
}

/// A record that could not be decoded. Discarded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record truncated: {len} bytes, expected {expected}")]
    Truncated { len: usize, expected: usize },

    #[error("record malformed: unknown verdict byte {verdict}")]
    Malformed { verdict: u8 },
}

impl DecodeError {
    /// Label for `flowscope_ingest_records_discarded_total`.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Truncated { .. } => "truncated",
            DecodeError::Malformed { .. } => "malformed",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event channel failed {failures} consecutive reads: {last}")]
    Sustained {
        failures: u32,
        #[source]
        last: ReadError,
    },
}

impl IngestError {
    pub fn sustained(failures: u32, last: ReadError) -> Self {
        Self::Sustained { failures, last }
    }
}
