#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]
#![cfg_attr(target_arch = "mips", feature(asm_experimental_arch))]

//! Thread lifecycle and context-switch core for small preemptive kernels.
//!
//! This library provides the layer of an MCU kernel that sits between the
//! scheduler and raw machine state: thread control blocks, the synthetic
//! first frame of a new thread, the trap-based context switch, and the
//! interrupt lock discipline everything else is protected by.
//!
//! # Target Platforms
//!
//! - **MIPS32r2** (reference): `syscall`-driven switch, 36-word frame
//! - **RISC-V RV32** machine mode: `ecall`-driven switch, same scheme
//! - **Host**: a simulated MIPS32 core for tests (`std-shim`)
//!
//! # Features
//!
//! - `stack-monitor`: check free stack space on every save (default)
//! - `stack-sentinel`: fill new stacks with a pattern for usage scans
//! - `frame-poison`: poison synthetic frames in release builds too
//! - `coop-only` / `preempt-only`: restrict the priority layout
//! - `critical-section-impl`: back the `critical-section` crate
//! - `std-shim`: enable the simulated CPU outside of tests
//!
//! # Quick Start
//!
//! ```ignore
//! use ukern_threads::{DefaultScheduler, Kernel, SchedConfig, ThreadOptions, ThreadStack, Tcb};
//! use ukern_threads::arch::DefaultArch;
//!
//! static KERNEL: Kernel<DefaultArch, DefaultScheduler> =
//!     Kernel::new(DefaultArch, DefaultScheduler::new(), SchedConfig::DEFAULT);
//! static mut WORKER: Tcb = Tcb::named("worker");
//! static mut WORKER_STACK: ThreadStack<2048> = ThreadStack::new();
//!
//! fn worker(a: usize, _: usize, _: usize) {
//!     loop { /* thread work */ }
//! }
//!
//! fn kernel_main() -> ! {
//!     let (tcb, stack) = unsafe {
//!         (
//!             &mut *core::ptr::addr_of_mut!(WORKER),
//!             (*core::ptr::addr_of_mut!(WORKER_STACK)).region(),
//!         )
//!     };
//!     KERNEL.create_thread(tcb, stack, 2048, worker, [1, 0, 0], 5, ThreadOptions::empty());
//!     KERNEL.start();
//!     unreachable!()
//! }
//! ```

// Core modules
pub mod arch;
pub mod config;
pub mod cpuload;
pub mod errors;
pub mod irq;
pub mod kernel;
pub mod mem;
pub mod offsets;
pub mod sched;
pub mod thread;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(
    not(test),
    not(feature = "std-shim"),
    target_os = "none",
    any(target_arch = "mips", target_arch = "riscv32")
))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use arch::Arch;

    let _key = arch::DefaultArch.irq_lock();
    log::error!("{}", info);
    arch::DefaultArch.halt();
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, Mips32Frame, RegisterFrame, Riscv32Frame, TrapHooks};

// Kernel
pub use kernel::Kernel;

// Configuration
pub use config::SchedConfig;

// CPU load accounting
pub use cpuload::{CpuLoad, ThreadLoad};

// Scheduler
pub use sched::{DefaultScheduler, ReadyQueue, Scheduler};

// Threads
pub use thread::{
    set_thread_return_value, setup_new_thread, Tcb, ThreadEntry, ThreadOptions, ThreadRef,
    ThreadState, WakeupCause,
};

// Interrupt locking
#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
pub use irq::{irq_lock, irq_unlock};
pub use irq::{with_irq_locked, IrqGuard, IrqKey};

// Memory
pub use mem::{StackInfo, StackRegion, ThreadStack};

// Errors
pub use errors::{fatal, CreateError, FatalError};
