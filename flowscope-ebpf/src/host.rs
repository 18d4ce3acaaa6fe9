//! Stand-in for `aya_ebpf::programs::TcContext` when building for the host.

use alloc::vec::Vec;
use core::{mem, ptr};

/// A packet held in memory with the same bounds-checked `load` contract as the
/// kernel's `bpf_skb_load_bytes`: a read that would cross the end fails.
pub struct TcContext {
    data: Vec<u8>,
}

impl TcContext {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn load<T: Copy>(&self, offset: usize) -> Result<T, ()> {
        let end = offset.checked_add(mem::size_of::<T>()).ok_or(())?;
        if end > self.data.len() {
            return Err(());
        }
        // SAFETY: bounds checked above; T: Copy and read_unaligned tolerates any alignment.
        Ok(unsafe { ptr::read_unaligned(self.data.as_ptr().add(offset) as *const T) })
    }
}
