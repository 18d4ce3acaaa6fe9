//! Kernel-to-userspace event channel and the ingestion loop draining it.
//!
//! # Architecture
//!
//! - `ringbuf`: [`EventSource`] over the `FLOW_EVENTS` ring buffer and the
//!   `LOST_EVENTS` counter
//! - `decode`: pinned little-endian record layout
//! - `backoff`: retry schedule for transient read failures
//! - `ingest`: decode, enrich and hand off to distribution

pub mod backoff;
pub mod decode;
pub mod error;
pub mod ingest;
pub mod ringbuf;

use async_trait::async_trait;

pub use error::{DecodeError, IngestError, ReadError};

/// A batch-oriented reader of raw flow records.
#[async_trait]
pub trait EventSource: Send {
    /// Waits until records are available and appends them to `out`. May return
    /// with nothing appended on a spurious wakeup.
    async fn next_batch(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), ReadError>;

    /// Total samples the producer failed to enqueue since the channel was
    /// created. Monotonic.
    fn lost_samples(&mut self) -> Result<u64, ReadError>;
}
