#![no_std]

#[cfg(not(target_arch = "bpf"))]
extern crate alloc;

// Log macros compile to nothing off the bpf target so the classifier can be
// exercised on the host against the `host::TcContext` shim.
#[cfg(not(target_arch = "bpf"))]
macro_rules! debug { ($($tt:tt)*) => { { let _ = ($($tt)*); } }; }
#[cfg(not(target_arch = "bpf"))]
macro_rules! trace { ($($tt:tt)*) => { { let _ = ($($tt)*); } }; }

pub mod classifier;
#[cfg(not(target_arch = "bpf"))]
pub mod host;

#[cfg(not(target_arch = "bpf"))]
pub use host::TcContext;
