//! Building the first context of a thread.
//!
//! A new thread gets a synthetic register frame at the top of its stack that
//! looks exactly like one saved by a trap: program counter at the entry
//! trampoline, entry word and arguments in the argument registers and a
//! status word that makes the restore sequence return into thread mode. The
//! switch primitive then dispatches it like any other thread.

use core::mem::size_of;

use super::{Tcb, ThreadEntry, ThreadOptions, ThreadRef, ThreadState, WakeupCause};
use crate::arch::{Arch, RegisterFrame};
use crate::config::SchedConfig;
use crate::errors::CreateError;
use crate::mem::{StackInfo, StackRegion};

/// Initialize `tcb` so that switching to it runs `entry(args[0], args[1],
/// args[2])` on the first `stack_size` bytes of `stack`.
///
/// Nothing is written unless every check passes, so a rejected request
/// leaves `tcb` untouched.
#[allow(clippy::too_many_arguments)]
pub fn setup_new_thread<A: Arch>(
    arch: &A,
    config: &SchedConfig,
    tcb: &'static mut Tcb,
    mut stack: StackRegion,
    stack_size: usize,
    entry: ThreadEntry,
    args: [usize; 3],
    priority: i8,
    options: ThreadOptions,
) -> Result<ThreadRef, CreateError> {
    config.validate_priority(priority, options)?;
    if !matches!(tcb.state(), ThreadState::Unused | ThreadState::Dead) {
        return Err(CreateError::ThreadInUse);
    }
    let arg_words = narrow_args(args)?;
    let frame_addr =
        stack.frame_address(stack_size, size_of::<A::Frame>(), A::STACK_ALIGN)?;

    let mut frame = A::Frame::default();
    if cfg!(any(debug_assertions, feature = "frame-poison")) {
        frame.poison();
    }
    frame.set_pc(arch.entry_trampoline());
    frame.set_entry(arch.entry_word(entry), arg_words);
    frame.set_status(A::Frame::first_dispatch_status(arch.current_status()));
    arch.prepare_frame(&mut frame);

    if cfg!(feature = "stack-sentinel") {
        stack.fill_below(frame_addr);
    }
    stack.write_frame(frame_addr, &frame)?;

    tcb.stack_info = StackInfo {
        start: stack.base(),
        size: stack_size,
    };
    tcb.options = options;
    tcb.entry = Some(entry);
    tcb.args = args;
    tcb.set_priority(priority);
    tcb.set_wakeup_cause(WakeupCause::None);
    tcb.base.sched_locked.store(0, portable_atomic::Ordering::Relaxed);
    tcb.store_interrupt_lock_key(0);
    super::set_thread_return_value(tcb, 0);
    tcb.take_running_cycles();
    tcb.set_stack_pointer(frame_addr);
    tcb.set_state(ThreadState::Prestart);

    let thread = ThreadRef::new(tcb);
    log::debug!(
        "created thread {} prio {} stack {:#x}..{:#x} frame {:#x}",
        thread,
        priority,
        thread.stack_info().start,
        thread.stack_info().end(),
        frame_addr
    );
    Ok(thread)
}

/// Argument registers are 32 bits wide on every supported core.
fn narrow_args(args: [usize; 3]) -> Result<[u32; 3], CreateError> {
    let mut words = [0u32; 3];
    for (word, arg) in words.iter_mut().zip(args) {
        *word = u32::try_from(arg).map_err(|_| CreateError::ArgumentTooWide(arg))?;
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mips32::{poison_word, Mips32Frame, SR_EXL, SR_IE};
    use crate::arch::sim::{SimCpu, SIM_TRAMPOLINE};
    use crate::mem::ThreadStack;
    use crate::offsets::mips32::ESF_SIZEOF;
    use std::boxed::Box;

    fn noop(_: usize, _: usize, _: usize) {}

    fn fresh() -> &'static mut Tcb {
        Box::leak(Box::new(Tcb::named("t")))
    }

    fn aligned<const N: usize>() -> StackRegion {
        Box::leak(Box::new(ThreadStack::<N>::new())).region()
    }

    fn saved_frame(thread: ThreadRef) -> Mips32Frame {
        // SAFETY: the frame was written by setup_new_thread into leaked memory.
        unsafe { core::ptr::read(thread.stack_pointer() as *const Mips32Frame) }
    }

    #[test]
    fn synthetic_frame_contents() {
        let cpu = SimCpu::new();
        let stack = StackRegion::allocate(1024);
        let base = stack.base();
        let thread = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            fresh(),
            stack,
            1000,
            noop,
            [1, 2, 3],
            5,
            ThreadOptions::empty(),
        )
        .unwrap();

        let sp = thread.stack_pointer();
        assert_eq!(sp % 8, 0);
        assert!(sp + ESF_SIZEOF <= base + 1000);
        assert!(base + 1000 - (sp + ESF_SIZEOF) < 8);
        assert_eq!(thread.stack_info(), StackInfo { start: base, size: 1000 });
        assert_eq!(thread.state(), ThreadState::Prestart);
        assert_eq!(thread.priority(), 5);
        assert_eq!(thread.interrupt_lock_key(), 0);

        let frame = saved_frame(thread);
        assert_eq!(frame.epc, SIM_TRAMPOLINE);
        assert_eq!(frame.a0, cpu.entry_word(noop));
        assert_eq!((frame.a1, frame.a2, frame.a3), (1, 2, 3));
        assert_eq!(frame.sr, SR_IE | SR_EXL);
    }

    #[test]
    fn status_mirrors_creator() {
        let cpu = SimCpu::new();
        let key = cpu.irq_lock();
        let thread = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            fresh(),
            StackRegion::allocate(512),
            512,
            noop,
            [0; 3],
            0,
            ThreadOptions::empty(),
        )
        .unwrap();
        cpu.irq_unlock(key);
        assert_eq!(saved_frame(thread).sr, SR_EXL);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn untouched_registers_are_poisoned() {
        let cpu = SimCpu::new();
        let thread = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            fresh(),
            StackRegion::allocate(512),
            512,
            noop,
            [0; 3],
            0,
            ThreadOptions::empty(),
        )
        .unwrap();
        let frame = saved_frame(thread);
        assert_eq!(frame.at, poison_word(1));
        assert_eq!(frame.v0, poison_word(2));
        assert_eq!(frame.s0, poison_word(16));
        assert_eq!(frame.ra, poison_word(31));
    }

    #[test]
    fn rejected_requests_leave_tcb_untouched() {
        let cpu = SimCpu::new();
        let tcb = fresh();
        let tcb_addr = tcb as *const Tcb;
        let err = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            tcb,
            aligned::<128>(),
            128,
            noop,
            [0; 3],
            0,
            ThreadOptions::empty(),
        )
        .unwrap_err();
        assert_eq!(err, CreateError::StackTooSmall { size: 128, required: ESF_SIZEOF });
        // SAFETY: leaked above and no longer borrowed.
        let tcb = unsafe { &*tcb_addr };
        assert_eq!(tcb.state(), ThreadState::Unused);
        assert_eq!(tcb.stack_pointer(), 0);
    }

    #[test]
    fn frame_sized_stack_is_enough() {
        let cpu = SimCpu::new();
        let stack = aligned::<ESF_SIZEOF>();
        let base = stack.base();
        let thread = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            fresh(),
            stack,
            ESF_SIZEOF,
            noop,
            [4, 5, 6],
            0,
            ThreadOptions::empty(),
        )
        .unwrap();
        assert_eq!(thread.stack_pointer(), base);
        assert_eq!(saved_frame(thread).epc, SIM_TRAMPOLINE);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn wide_arguments_are_rejected() {
        let cpu = SimCpu::new();
        let err = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            fresh(),
            StackRegion::allocate(512),
            512,
            noop,
            [0, 1 << 40, 0],
            0,
            ThreadOptions::empty(),
        )
        .unwrap_err();
        assert_eq!(err, CreateError::ArgumentTooWide(1 << 40));
    }

    #[test]
    fn live_thread_cannot_be_recreated() {
        let cpu = SimCpu::new();
        let tcb = fresh();
        tcb.set_state(ThreadState::Ready);
        let err = setup_new_thread(
            &cpu,
            &SchedConfig::DEFAULT,
            tcb,
            StackRegion::allocate(512),
            512,
            noop,
            [0; 3],
            0,
            ThreadOptions::empty(),
        )
        .unwrap_err();
        assert_eq!(err, CreateError::ThreadInUse);
    }

    #[test]
    fn idle_priority_needs_the_idle_option() {
        let cpu = SimCpu::new();
        let config = SchedConfig::DEFAULT;
        let idle = config.idle_priority();
        let make = |options| {
            setup_new_thread(
                &cpu,
                &config,
                fresh(),
                StackRegion::allocate(512),
                512,
                noop,
                [0; 3],
                idle,
                options,
            )
        };
        assert!(matches!(make(ThreadOptions::empty()), Err(CreateError::InvalidPriority { .. })));
        assert!(make(ThreadOptions::IDLE).is_ok());
    }
}
