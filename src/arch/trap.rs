//! Portable half of trap handling.
//!
//! The assembly entry of each architecture pushes a full register frame and
//! calls into here with its address. Whatever comes back decides which saved
//! frame the restore sequence pops: the same one, or the one whose address is
//! stored in the returned TCB.

use super::barriers::MemoryBarriers;
use super::TrapHooks;
#[cfg(feature = "stack-monitor")]
use crate::config::STACK_MONITOR_WARN_THRESHOLD;
#[cfg(feature = "stack-monitor")]
use crate::errors::{fatal, FatalError};
#[cfg(feature = "stack-monitor")]
use crate::mem::StackInfo;
use crate::thread::ThreadRef;

/// Publish the address of `thread`'s freshly saved frame.
///
/// The frame stores are ordered before the `stack_pointer` store, so anyone
/// who observes the new value also observes the complete frame.
pub(crate) fn record_outgoing(thread: ThreadRef, frame_addr: usize) {
    #[cfg(feature = "stack-monitor")]
    match check_stack(&thread.stack_info(), frame_addr) {
        StackVerdict::Healthy => {}
        StackVerdict::Low(free) => log::warn!(
            "thread {}: sp {:#x}: stack only has {} bytes free",
            thread,
            frame_addr,
            free
        ),
        StackVerdict::Overflow => fatal(FatalError::StackOverflow {
            sp: frame_addr,
            stack_start: thread.stack_info().start,
        }),
    }
    MemoryBarriers::full_barrier();
    thread.set_stack_pointer(frame_addr);
}

/// What the stack monitor makes of a frame saved at some address.
#[cfg(feature = "stack-monitor")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackVerdict {
    Healthy,
    /// At or below the warning threshold, with this many bytes left
    Low(usize),
    Overflow,
}

#[cfg(feature = "stack-monitor")]
pub(crate) fn check_stack(info: &StackInfo, sp: usize) -> StackVerdict {
    if info.size == 0 {
        return StackVerdict::Healthy;
    }
    // SAFETY: a thread's stack memory lives as long as the thread.
    match unsafe { info.free_below(sp) } {
        None | Some(0) => StackVerdict::Overflow,
        Some(free) if free <= STACK_MONITOR_WARN_THRESHOLD => StackVerdict::Low(free),
        Some(_) => StackVerdict::Healthy,
    }
}

/// Interrupt path shared by every architecture: bracket the handler with
/// the kernel's bookkeeping and, if it decides to preempt, park the
/// interrupted frame in the outgoing thread.
pub(crate) fn run_interrupt(
    hooks: Option<&dyn TrapHooks>,
    frame_addr: usize,
    isr: impl FnOnce(),
) -> Option<ThreadRef> {
    if let Some(hooks) = hooks {
        hooks.interrupt_enter();
    }
    isr();
    let (outgoing, incoming) = hooks?.interrupt_exit()?;
    record_outgoing(outgoing, frame_addr);
    Some(incoming)
}

#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
pub use hw::set_irq_handler;
#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
pub(crate) use hw::{install_hooks, interrupt, request_switch, thread_exit, voluntary_switch};

#[cfg(any(target_arch = "mips", target_arch = "riscv32"))]
mod hw {
    use core::ptr;

    use portable_atomic::{AtomicPtr, Ordering};
    use spin::Once;

    use super::{record_outgoing, run_interrupt};
    use crate::arch::TrapHooks;
    use crate::errors::{fatal, FatalError};
    use crate::thread::{Tcb, ThreadRef};

    static HOOKS: Once<&'static dyn TrapHooks> = Once::new();
    static IRQ_HANDLER: Once<fn()> = Once::new();
    static PENDING_OUT: AtomicPtr<Tcb> = AtomicPtr::new(ptr::null_mut());
    static PENDING_IN: AtomicPtr<Tcb> = AtomicPtr::new(ptr::null_mut());

    pub(crate) fn install_hooks(hooks: &'static dyn TrapHooks) {
        HOOKS.call_once(|| hooks);
    }

    fn hooks() -> Option<&'static dyn TrapHooks> {
        HOOKS.get().copied()
    }

    /// Register the platform interrupt demultiplexer, called for every
    /// interrupt between the kernel's enter and exit bookkeeping.
    pub fn set_irq_handler(handler: fn()) {
        IRQ_HANDLER.call_once(|| handler);
    }

    /// Stage a voluntary switch for the next switch trap.
    pub(crate) fn request_switch(outgoing: Option<ThreadRef>, incoming: ThreadRef) {
        let out = outgoing.map_or(ptr::null_mut(), |t| t.as_ptr().cast_mut());
        PENDING_OUT.store(out, Ordering::Relaxed);
        PENDING_IN.store(incoming.as_ptr().cast_mut(), Ordering::Release);
    }

    /// Switch trap: the saved pc already points past the trapping
    /// instruction. Returns the TCB to restore.
    pub(crate) fn voluntary_switch(frame_addr: usize) -> *const Tcb {
        let incoming = PENDING_IN.swap(ptr::null_mut(), Ordering::Acquire);
        let outgoing = PENDING_OUT.swap(ptr::null_mut(), Ordering::Relaxed);
        // SAFETY: both slots only ever hold pointers from `ThreadRef::as_ptr`.
        let (outgoing, incoming) = unsafe { (ThreadRef::from_ptr(outgoing), ThreadRef::from_ptr(incoming)) };
        let Some(incoming) = incoming else {
            fatal(FatalError::SpuriousSwitch)
        };
        if let Some(outgoing) = outgoing {
            record_outgoing(outgoing, frame_addr);
        }
        incoming.as_ptr()
    }

    /// Interrupt trap. Null means resume the interrupted frame.
    pub(crate) fn interrupt(frame_addr: usize) -> *const Tcb {
        let isr = || {
            if let Some(handler) = IRQ_HANDLER.get() {
                handler();
            }
        };
        run_interrupt(hooks(), frame_addr, isr).map_or(ptr::null(), ThreadRef::as_ptr)
    }

    /// Where the entry trampoline goes once the entry function returned.
    pub(crate) fn thread_exit() -> ! {
        match hooks() {
            Some(hooks) => hooks.thread_exit(),
            None => fatal(FatalError::NoCurrentThread),
        }
        // `thread_exit` switches away for good; getting here means the
        // kernel halted instead.
        loop {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::StackInfo;
    use crate::thread::Tcb;
    use portable_atomic::{AtomicUsize, Ordering};
    use std::boxed::Box;

    fn thread_on(stack: StackInfo) -> ThreadRef {
        let mut tcb = Tcb::named("trap");
        tcb.stack_info = stack;
        ThreadRef::new(Box::leak(Box::new(tcb)))
    }

    #[test]
    fn saved_frame_address_is_published() {
        let thread = thread_on(StackInfo { start: 0x1000, size: 0x1000 });
        record_outgoing(thread, 0x1800);
        assert_eq!(thread.stack_pointer(), 0x1800);
    }

    #[cfg(feature = "stack-monitor")]
    #[test]
    #[should_panic(expected = "stack overflow")]
    fn frame_at_stack_start_is_fatal() {
        let thread = thread_on(StackInfo { start: 0x1000, size: 0x1000 });
        record_outgoing(thread, 0x1000);
    }

    #[cfg(feature = "stack-monitor")]
    #[test]
    #[should_panic(expected = "stack overflow")]
    fn frame_below_stack_is_fatal() {
        let thread = thread_on(StackInfo { start: 0x1000, size: 0x1000 });
        record_outgoing(thread, 0xf70);
    }

    #[cfg(feature = "stack-monitor")]
    #[test]
    fn low_stack_is_reported_before_it_overflows() {
        use crate::config::STACK_MONITOR_WARN_THRESHOLD as WARN;
        use crate::mem::ThreadStack;

        let mut region = Box::leak(Box::new(ThreadStack::<512>::new())).region();
        let start = region.base();
        region.fill_below(start + 512);
        let info = StackInfo { start, size: 512 };

        assert_eq!(check_stack(&info, start + WARN), StackVerdict::Low(WARN));
        assert_eq!(check_stack(&info, start + WARN + 8), StackVerdict::Healthy);
        assert_eq!(check_stack(&info, start + 8), StackVerdict::Low(8));
        assert_eq!(check_stack(&info, start), StackVerdict::Overflow);
        assert_eq!(check_stack(&StackInfo::EMPTY, 0), StackVerdict::Healthy);

        // Low space is only a warning: the frame is still published.
        let thread = thread_on(info);
        record_outgoing(thread, start + WARN);
        assert_eq!(thread.stack_pointer(), start + WARN);
    }

    struct Preempting {
        from: ThreadRef,
        to: ThreadRef,
        entered: AtomicUsize,
    }

    impl TrapHooks for Preempting {
        fn thread_exit(&self) {}

        fn interrupt_enter(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn interrupt_exit(&self) -> Option<(ThreadRef, ThreadRef)> {
            Some((self.from, self.to))
        }
    }

    #[test]
    fn preempting_interrupt_parks_the_interrupted_frame() {
        let from = thread_on(StackInfo { start: 0x4000, size: 0x1000 });
        let to = thread_on(StackInfo { start: 0x8000, size: 0x1000 });
        let hooks = Preempting { from, to, entered: AtomicUsize::new(0) };
        let ran = AtomicUsize::new(0);

        let next = run_interrupt(Some(&hooks), 0x4c00, || {
            ran.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(next, Some(to));
        assert_eq!(from.stack_pointer(), 0x4c00);
        assert_eq!(hooks.entered.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupt_without_kernel_resumes_in_place() {
        let ran = AtomicUsize::new(0);
        let next = run_interrupt(None, 0x4c00, || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(next, None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
