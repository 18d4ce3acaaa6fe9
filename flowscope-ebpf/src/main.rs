#![cfg_attr(target_arch = "bpf", no_std, no_main)]

#[cfg(target_arch = "bpf")]
mod program {
    use aya_ebpf::{
        bindings::TC_ACT_PIPE,
        helpers::bpf_ktime_get_ns,
        macros::{classifier, map},
        maps::{PerCpuArray, RingBuf},
        programs::TcContext,
    };
    use aya_log_ebpf::trace;
    use flowscope_ebpf::classifier::classify;

    #[map]
    static FLOW_EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0); // 256 KB

    /// Samples the classifier could not reserve space for. Slot 0 only.
    #[map]
    static LOST_EVENTS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

    #[classifier]
    pub fn flowscope_ingress(ctx: TcContext) -> i32 {
        observe(&ctx)
    }

    #[classifier]
    pub fn flowscope_egress(ctx: TcContext) -> i32 {
        observe(&ctx)
    }

    /// Never changes the packet's fate; the verdict is always `TC_ACT_PIPE`.
    #[inline(always)]
    fn observe(ctx: &TcContext) -> i32 {
        // SAFETY: helper has no preconditions.
        let now = unsafe { bpf_ktime_get_ns() };
        if let Some(record) = classify(ctx, now) {
            if FLOW_EVENTS.output(&record, 0).is_err() {
                trace!(ctx, "flowscope: ring buffer full, sample lost");
                if let Some(lost) = LOST_EVENTS.get_ptr_mut(0) {
                    // SAFETY: per-cpu slot, no concurrent writer on this cpu.
                    unsafe { *lost += 1 };
                }
            }
        }
        TC_ACT_PIPE
    }

    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo) -> ! {
        loop {}
    }

    #[unsafe(link_section = "license")]
    #[unsafe(no_mangle)]
    static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
}

#[cfg(not(target_arch = "bpf"))]
fn main() {}
