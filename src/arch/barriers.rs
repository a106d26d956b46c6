//! Memory barriers around context save and restore.

pub struct MemoryBarriers;

impl MemoryBarriers {
    /// Order every earlier store before every later access, including
    /// against code entered through a trap.
    #[inline(always)]
    pub fn full_barrier() {
        #[cfg(target_arch = "mips")]
        // SAFETY: `sync` has no operands and only orders memory accesses.
        unsafe {
            core::arch::asm!("sync", options(nostack, preserves_flags));
        }

        #[cfg(target_arch = "riscv32")]
        // SAFETY: as above.
        unsafe {
            core::arch::asm!("fence rw, rw", options(nostack, preserves_flags));
        }

        #[cfg(not(any(target_arch = "mips", target_arch = "riscv32")))]
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
