//! Architecture abstraction layer for context switching and interrupt masking.
//!
//! Each supported CPU provides an [`Arch`] implementation together with a
//! [`RegisterFrame`] describing the exact layout its trap entry pushes. The
//! portable kernel only ever talks to these two traits; everything that needs
//! direct register control lives behind them.

use crate::irq::IrqKey;
use crate::thread::{ThreadEntry, ThreadRef};

pub mod barriers;
pub mod mips32;
pub mod riscv32;
pub mod trap;

#[cfg(target_arch = "mips")]
pub mod mips32_switch;
#[cfg(target_arch = "riscv32")]
pub mod riscv32_switch;

#[cfg(any(test, feature = "std-shim"))]
pub mod sim;

pub use mips32::Mips32Frame;
pub use riscv32::Riscv32Frame;

#[cfg(target_arch = "mips")]
pub use mips32_switch::Mips32 as DefaultArch;
#[cfg(target_arch = "riscv32")]
pub use riscv32_switch::Riscv32 as DefaultArch;
#[cfg(all(
    not(any(target_arch = "mips", target_arch = "riscv32")),
    any(test, feature = "std-shim")
))]
pub use sim::SimCpu as DefaultArch;

/// Layout of a saved register set.
///
/// Trap frames pushed by the exception entry and synthetic frames built for
/// new threads share this layout, so the restore path cannot tell them apart.
pub trait RegisterFrame: Copy + Default + Send + Sync + 'static {
    /// Saved program counter (the address `eret`/`mret` returns to).
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);

    /// Saved processor status.
    fn status(&self) -> u32;
    fn set_status(&mut self, status: u32);

    /// Entry function word and the three argument words the entry
    /// trampoline receives.
    fn entry(&self) -> (u32, [u32; 3]);
    fn set_entry(&mut self, entry: u32, args: [u32; 3]);

    /// Status a synthetic frame carries so that restoring it behaves like
    /// returning from a trap taken while `current` was live.
    fn first_dispatch_status(current: u32) -> u32;

    /// Fill every general-purpose register slot with a recognisable value.
    fn poison(&mut self);
}

/// Kernel entry points the trap path calls back into.
///
/// Installed once by `Kernel::start`.
pub trait TrapHooks: Sync {
    /// Runs on the thread's own stack after its entry function returned.
    /// Does not return on hardware.
    fn thread_exit(&self);

    /// An interrupt was taken.
    fn interrupt_enter(&self);

    /// The interrupt handler finished. Returns the outgoing and incoming
    /// threads if the interrupted thread must be preempted; the caller then
    /// records the interrupted frame in the outgoing TCB and restores the
    /// incoming one.
    fn interrupt_exit(&self) -> Option<(ThreadRef, ThreadRef)>;
}

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations manipulate the live register file. All methods marked
/// unsafe have preconditions that must be upheld by the caller.
pub trait Arch: Sync {
    /// Saved context layout.
    type Frame: RegisterFrame;

    const NAME: &'static str;

    /// Required alignment of a saved frame and of the stack pointer.
    const STACK_ALIGN: usize;

    /// Mask interrupts and return the previous state.
    fn irq_lock(&self) -> IrqKey;

    /// Restore the interrupt state recorded in `key`.
    fn irq_unlock(&self, key: IrqKey);

    /// Whether interrupts are currently masked.
    fn irq_is_locked(&self) -> bool;

    /// Current processor status register.
    fn current_status(&self) -> u32;

    /// Free-running cycle counter used for CPU load accounting. Wraps.
    fn cycle_count(&self) -> u32;

    /// Code address of the entry trampoline placed in synthetic frames.
    fn entry_trampoline(&self) -> u32;

    /// Word placed in the first argument register of a synthetic frame,
    /// decoded again by the entry trampoline.
    fn entry_word(&self, entry: ThreadEntry) -> u32;

    /// Architecture-specific touches on a synthetic frame (global pointer,
    /// thread pointer).
    fn prepare_frame(&self, _frame: &mut Self::Frame) {}

    /// Route exits and interrupts to the kernel.
    fn install_hooks(&self, hooks: &'static dyn TrapHooks);

    /// Save the running context into `outgoing` (if any) and resume
    /// `incoming` from its saved frame.
    ///
    /// Returns when `outgoing` is switched back in. With no outgoing thread
    /// hardware implementations never return.
    ///
    /// # Safety
    ///
    /// - Interrupts must be masked.
    /// - `incoming.stack_pointer()` must address a valid frame inside its
    ///   stack, either saved by a previous switch or synthesized at creation.
    /// - `outgoing`, when given, must be the thread whose context is live.
    unsafe fn context_switch(&self, outgoing: Option<ThreadRef>, incoming: ThreadRef);

    /// Stop executing threads. Hardware parks the core for good.
    fn halt(&self);
}
