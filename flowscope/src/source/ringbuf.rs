//! [`EventSource`] over the classifier's `FLOW_EVENTS` ring buffer.

use std::io;

use async_trait::async_trait;
use aya::{
    Ebpf,
    maps::{Map, MapData, PerCpuArray, RingBuf},
};
use tokio::io::unix::AsyncFd;

use crate::{
    metrics::registry,
    source::{EventSource, ReadError},
};

pub const FLOW_EVENTS_MAP: &str = "FLOW_EVENTS";
pub const LOST_EVENTS_MAP: &str = "LOST_EVENTS";

/// Event-driven reader: waits on the ring buffer fd instead of polling, then
/// drains everything available in one batch.
pub struct RingBufSource {
    ring_buf: AsyncFd<RingBuf<MapData>>,
    lost_events: PerCpuArray<MapData, u64>,
}

impl RingBufSource {
    /// Takes ownership of both maps out of the loaded object.
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self, ReadError> {
        let ring_map = take_map(ebpf, FLOW_EVENTS_MAP)?;
        let lost_map = take_map(ebpf, LOST_EVENTS_MAP)?;

        let ring_buf = RingBuf::try_from(ring_map).map_err(ReadError::transient)?;
        let lost_events = PerCpuArray::try_from(lost_map).map_err(ReadError::transient)?;
        let ring_buf = AsyncFd::new(ring_buf).map_err(ReadError::transient)?;

        Ok(Self {
            ring_buf,
            lost_events,
        })
    }
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<Map, ReadError> {
    ebpf.take_map(name)
        .ok_or_else(|| ReadError::transient(format!("{name} map not present in the object")))
}

fn classify_io_error(e: io::Error) -> ReadError {
    if e.raw_os_error() == Some(libc::EBADF) {
        ReadError::Closed
    } else {
        ReadError::transient(e)
    }
}

#[async_trait]
impl EventSource for RingBufSource {
    async fn next_batch(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), ReadError> {
        let mut guard = self
            .ring_buf
            .readable_mut()
            .await
            .map_err(classify_io_error)?;

        let ring_buf = guard.get_inner_mut();
        let before = out.len();
        while let Some(item) = ring_buf.next() {
            out.push(item.to_vec());
        }
        registry::EBPF_RINGBUF_RECORDS_TOTAL.inc_by((out.len() - before) as u64);

        guard.clear_ready();
        Ok(())
    }

    fn lost_samples(&mut self) -> Result<u64, ReadError> {
        let per_cpu = self.lost_events.get(&0, 0).map_err(ReadError::transient)?;
        Ok(per_cpu.iter().copied().sum())
    }
}
