//! Kernel context tying the architecture layer to a scheduler.
//!
//! [`Kernel`] owns the notion of the current thread. Only the switch path
//! writes it; everything else reads. Blocking primitives are built on
//! [`Kernel::swap`], which is the one place a thread gives up the CPU from
//! thread context. Interrupt-driven preemption goes through the
//! [`TrapHooks`] implementation instead.

use core::ptr;

use alloc::vec::Vec;
use portable_atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::arch::{Arch, TrapHooks};
use crate::config::{SchedConfig, SWAP_DEFAULT_RETURN};
use crate::cpuload::{CpuLoad, ThreadLoad};
use crate::errors::{fatal, CreateError, FatalError};
use crate::irq::IrqKey;
use crate::mem::StackRegion;
use crate::sched::Scheduler;
use crate::thread::{
    set_thread_return_value, setup_new_thread, Tcb, ThreadEntry, ThreadOptions, ThreadRef,
    ThreadState, WakeupCause,
};

/// Main kernel handle.
///
/// # Type Parameters
///
/// * `A` - Architecture implementation
/// * `S` - Scheduler implementation
pub struct Kernel<A: Arch, S: Scheduler> {
    arch: A,
    scheduler: S,
    config: SchedConfig,
    /// Thread whose context is live on the CPU.
    current: AtomicPtr<Tcb>,
    /// Interrupt nesting depth.
    nested: AtomicU32,
    started: AtomicBool,
    /// Every thread created through this kernel, for load reports.
    threads: spin::Mutex<Vec<ThreadRef>>,
    load_enabled: AtomicBool,
    load_window_start: AtomicU32,
}

impl<A: Arch, S: Scheduler> Kernel<A, S> {
    pub const fn new(arch: A, scheduler: S, config: SchedConfig) -> Self {
        Self {
            arch,
            scheduler,
            config,
            current: AtomicPtr::new(ptr::null_mut()),
            nested: AtomicU32::new(0),
            started: AtomicBool::new(false),
            threads: spin::Mutex::new(Vec::new()),
            load_enabled: AtomicBool::new(false),
            load_window_start: AtomicU32::new(0),
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Create a thread, stopping the system if the request is invalid.
    ///
    /// The thread becomes ready immediately unless `options` contains
    /// [`ThreadOptions::SUSPENDED`].
    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &self,
        tcb: &'static mut Tcb,
        stack: StackRegion,
        stack_size: usize,
        entry: ThreadEntry,
        args: [usize; 3],
        priority: i8,
        options: ThreadOptions,
    ) -> ThreadRef {
        self.try_create_thread(tcb, stack, stack_size, entry, args, priority, options)
            .unwrap_or_else(|err| fatal(err.into()))
    }

    /// Like [`create_thread`](Self::create_thread), but hands the rejection
    /// back instead of taking the fatal path.
    #[allow(clippy::too_many_arguments)]
    pub fn try_create_thread(
        &self,
        tcb: &'static mut Tcb,
        stack: StackRegion,
        stack_size: usize,
        entry: ThreadEntry,
        args: [usize; 3],
        priority: i8,
        options: ThreadOptions,
    ) -> Result<ThreadRef, CreateError> {
        let thread = setup_new_thread(
            &self.arch,
            &self.config,
            tcb,
            stack,
            stack_size,
            entry,
            args,
            priority,
            options,
        )?;
        self.register(thread);
        if !options.contains(ThreadOptions::SUSPENDED) {
            self.start_thread(thread);
        }
        Ok(thread)
    }

    fn register(&self, thread: ThreadRef) {
        let key = self.arch.irq_lock();
        let mut threads = self.threads.lock();
        if !threads.contains(&thread) {
            threads.push(thread);
        }
        drop(threads);
        self.arch.irq_unlock(key);
    }

    /// Make a thread created suspended ready to run. Does nothing for a
    /// thread that was already started.
    pub fn start_thread(&self, thread: ThreadRef) {
        let key = self.arch.irq_lock();
        if thread.state() != ThreadState::Prestart {
            self.arch.irq_unlock(key);
            return;
        }
        thread.set_state(ThreadState::Ready);
        log::debug!("thread {} ready at priority {}", thread, thread.priority());
        self.scheduler.enqueue(thread);
        self.reschedule(key);
    }

    /// Dispatch the most important ready thread.
    ///
    /// Hardware never comes back from here. On the simulator the call
    /// returns once the first thread has been handed the CPU.
    pub fn start(&'static self)
    where
        A: 'static,
        S: 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.arch.install_hooks(self);
        // Released by whoever this context is restored into; the boot
        // context itself is never resumed.
        let _boot_key = self.arch.irq_lock();
        let Some(first) = self.scheduler.pick_next() else {
            fatal(FatalError::NoRunnableThread)
        };
        log::debug!("starting scheduler on {} with thread {}", A::NAME, first);
        // SAFETY: interrupts are masked and `first` was set up by
        // `setup_new_thread`.
        unsafe { self.context_switch(None, first) };
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<ThreadRef> {
        // SAFETY: only `hand_over` stores here, always from a `ThreadRef`.
        unsafe { ThreadRef::from_ptr(self.current.load(Ordering::Acquire)) }
    }

    /// Whether the caller runs inside an interrupt handler.
    pub fn is_in_isr(&self) -> bool {
        self.nested.load(Ordering::Acquire) > 0
    }

    pub fn irq_lock(&self) -> IrqKey {
        self.arch.irq_lock()
    }

    pub fn irq_unlock(&self, key: IrqKey) {
        self.arch.irq_unlock(key)
    }

    /// Give the CPU to the most important ready thread.
    ///
    /// The current thread must already be queued or blocked; it resumes
    /// here when it is picked again. `key` is kept in the thread while it is
    /// switched out and released on resume. Returns the value set with
    /// [`set_thread_return_value`], `-EAGAIN` if nobody set one.
    pub fn swap(&self, key: IrqKey) -> i32 {
        let Some(current) = self.current() else {
            fatal(FatalError::NoCurrentThread)
        };
        debug_assert!(!self.is_in_isr(), "swap from interrupt context");
        current.store_interrupt_lock_key(key.into_raw());
        set_thread_return_value(&current, SWAP_DEFAULT_RETURN);

        let Some(next) = self.scheduler.pick_next() else {
            fatal(FatalError::NoRunnableThread)
        };
        if next == current {
            current.set_state(ThreadState::Running);
        } else {
            // SAFETY: interrupts are masked since `key` was taken and
            // `current` owns the live context.
            unsafe { self.context_switch(Some(current), next) };
        }

        self.arch
            .irq_unlock(IrqKey::from_raw(current.take_interrupt_lock_key()));
        current.return_value()
    }

    /// Let every ready thread of the same or higher importance run first.
    pub fn yield_now(&self) {
        let key = self.arch.irq_lock();
        let Some(current) = self.current() else {
            self.arch.irq_unlock(key);
            return;
        };
        current.set_state(ThreadState::Ready);
        self.scheduler.enqueue(current);
        self.swap(key);
    }

    /// Block the current thread until [`wake`](Self::wake) is called on it.
    /// Returns the wake value.
    pub fn pend_current(&self, key: IrqKey) -> i32 {
        let Some(current) = self.current() else {
            fatal(FatalError::NoCurrentThread)
        };
        current.set_wakeup_cause(WakeupCause::None);
        current.set_state(ThreadState::Pending);
        self.swap(key)
    }

    /// Make a pending thread ready, delivering `value` as its `swap` result.
    /// Returns `false` if the thread was not pending.
    pub fn wake(&self, thread: ThreadRef, value: i32) -> bool {
        let key = self.arch.irq_lock();
        if thread.state() != ThreadState::Pending {
            self.arch.irq_unlock(key);
            return false;
        }
        set_thread_return_value(&thread, value);
        thread.set_wakeup_cause(WakeupCause::Signaled);
        thread.set_state(ThreadState::Ready);
        self.scheduler.enqueue(thread);
        self.reschedule(key);
        true
    }

    /// Keep the current thread from being preempted. Nests.
    pub fn sched_lock(&self) {
        if let Some(current) = self.current() {
            current.lock_scheduler();
        }
    }

    /// Undo one [`sched_lock`](Self::sched_lock); the outermost unlock
    /// switches if a more important thread became ready meanwhile.
    pub fn sched_unlock(&self) {
        let key = self.arch.irq_lock();
        match self.current() {
            Some(current) if current.unlock_scheduler() == 0 => self.reschedule(key),
            _ => self.arch.irq_unlock(key),
        }
    }

    /// Terminate the current thread and run the next one.
    ///
    /// With nothing left to run the CPU halts. Exiting an essential thread
    /// is fatal.
    pub fn exit_current(&self) {
        // Never released: the context that took it is discarded.
        let _key = self.arch.irq_lock();
        let Some(current) = self.current() else {
            fatal(FatalError::NoCurrentThread)
        };
        if current.options().contains(ThreadOptions::ESSENTIAL) {
            fatal(FatalError::EssentialThreadExit);
        }
        current.set_state(ThreadState::Dead);
        self.scheduler.dequeue(current);
        log::debug!("thread {} exited", current);

        match self.scheduler.pick_next() {
            // SAFETY: interrupts masked; the dead context is not saved.
            Some(next) => unsafe { self.context_switch(None, next) },
            None => {
                log::info!("no runnable thread left, halting");
                self.current.store(ptr::null_mut(), Ordering::Release);
                self.arch.halt();
            }
        }
    }

    /// Start charging every hand-over of the CPU to the outgoing thread.
    /// Clears the counters of all threads and opens a new window.
    pub fn cpu_load_start(&self) {
        let key = self.arch.irq_lock();
        let now = self.arch.cycle_count();
        for thread in self.threads.lock().iter() {
            thread.take_running_cycles();
        }
        if let Some(current) = self.current() {
            current.start_cycles(now);
        }
        self.load_window_start.store(now, Ordering::Relaxed);
        self.load_enabled.store(true, Ordering::Release);
        self.arch.irq_unlock(key);
    }

    pub fn cpu_load_stop(&self) {
        self.load_enabled.store(false, Ordering::Release);
    }

    /// Running cycles of every thread since the last snapshot. The counters
    /// are cleared and a new window starts.
    pub fn cpu_load(&self) -> CpuLoad {
        let key = self.arch.irq_lock();
        let now = self.arch.cycle_count();
        let current = self.current();
        if let Some(current) = current.filter(|_| self.load_enabled.load(Ordering::Acquire)) {
            current.charge_cycles(now);
        }
        let window_cycles = now.wrapping_sub(self.load_window_start.swap(now, Ordering::Relaxed));
        let threads = self
            .threads
            .lock()
            .iter()
            .map(|&thread| ThreadLoad {
                thread,
                priority: thread.priority(),
                state: thread.state(),
                running_cycles: thread.take_running_cycles(),
                is_current: current == Some(thread),
            })
            .collect();
        self.arch.irq_unlock(key);
        CpuLoad {
            window_cycles,
            threads,
        }
    }

    /// Switch from `outgoing` (if any) to `incoming`, making `incoming` the
    /// current thread.
    ///
    /// Callers keep the scheduler state consistent: `outgoing` must already
    /// be queued, blocked or dead.
    ///
    /// # Safety
    ///
    /// Same contract as [`Arch::context_switch`].
    pub unsafe fn context_switch(&self, outgoing: Option<ThreadRef>, incoming: ThreadRef) {
        debug_assert!(self.arch.irq_is_locked(), "context switch with interrupts enabled");
        self.hand_over(incoming);
        // SAFETY: forwarded.
        unsafe { self.arch.context_switch(outgoing, incoming) }
    }

    fn hand_over(&self, incoming: ThreadRef) {
        if incoming.state() != ThreadState::Ready {
            fatal(FatalError::SwitchToUnready(incoming.state()));
        }
        if self.load_enabled.load(Ordering::Acquire) {
            let now = self.arch.cycle_count();
            if let Some(outgoing) = self.current() {
                outgoing.charge_cycles(now);
            }
            incoming.start_cycles(now);
        }
        incoming.set_state(ThreadState::Running);
        self.current
            .store(incoming.as_ptr().cast_mut(), Ordering::Release);
        log::trace!("switching to thread {}", incoming);
    }

    /// Whether `current` has to give way to the head of the ready queue.
    fn must_preempt(&self, current: ThreadRef) -> bool {
        !self.config.is_cooperative(current.priority())
            && current.sched_locked() == 0
            && self
                .scheduler
                .peek_next()
                .is_some_and(|next| next.priority() < current.priority())
    }

    /// Switch away from thread context if a ready thread outranks the
    /// current one; otherwise just release `key`.
    fn reschedule(&self, key: IrqKey) {
        let current = match self.current() {
            Some(current) if self.is_started() && !self.is_in_isr() => current,
            _ => return self.arch.irq_unlock(key),
        };
        if !self.must_preempt(current) {
            return self.arch.irq_unlock(key);
        }
        current.set_state(ThreadState::Ready);
        self.scheduler.enqueue(current);
        self.swap(key);
    }
}

impl<A: Arch, S: Scheduler> TrapHooks for Kernel<A, S> {
    fn thread_exit(&self) {
        self.exit_current();
    }

    fn interrupt_enter(&self) {
        self.nested.fetch_add(1, Ordering::AcqRel);
    }

    fn interrupt_exit(&self) -> Option<(ThreadRef, ThreadRef)> {
        if self.nested.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let current = self.current()?;
        if !self.must_preempt(current) {
            return None;
        }
        let next = self.scheduler.pick_next()?;
        current.set_state(ThreadState::Ready);
        self.scheduler.enqueue(current);
        self.hand_over(next);
        log::trace!("preempting thread {}", current);
        Some((current, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{Reg, SimCpu};
    use crate::sched::DefaultScheduler;
    use portable_atomic::{AtomicI32, AtomicUsize};
    use spin::{Lazy, Once};
    use std::boxed::Box;
    use std::vec::Vec;

    type SimKernel = Kernel<SimCpu, DefaultScheduler>;

    fn sim_kernel() -> SimKernel {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(SimCpu::new(), DefaultScheduler::new(), SchedConfig::DEFAULT)
    }

    fn tcb(name: &'static str) -> &'static mut Tcb {
        Box::leak(Box::new(Tcb::named(name)))
    }

    fn spawn(
        kernel: &SimKernel,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        priority: i8,
        options: ThreadOptions,
    ) -> ThreadRef {
        kernel.create_thread(
            tcb(name),
            StackRegion::allocate(2048),
            2048,
            entry,
            [arg, 0, 0],
            priority,
            options,
        )
    }

    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            self.0
        }
    }

    fn load_pattern(cpu: &SimCpu, seed: u32) -> Vec<u32> {
        let mut lcg = Lcg(seed);
        Reg::ALL
            .iter()
            .map(|reg| {
                let value = lcg.next();
                cpu.set_reg(*reg, value);
                value
            })
            .collect()
    }

    fn registers(cpu: &SimCpu) -> Vec<u32> {
        Reg::ALL.iter().map(|reg| cpu.reg(*reg)).collect()
    }

    mod counter {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static A: Once<ThreadRef> = Once::new();
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        static REGS_KEPT: AtomicBool = AtomicBool::new(false);
        static COUNT_SEEN: AtomicUsize = AtomicUsize::new(usize::MAX);

        fn increment(by: usize, _: usize, _: usize) {
            COUNTER.fetch_add(by, Ordering::SeqCst);
        }

        fn switcher(_: usize, _: usize, _: usize) {
            let Some(a) = A.get() else { return };
            K.start_thread(*a);
            let before = load_pattern(K.arch(), 0x5eed);
            K.yield_now();
            REGS_KEPT.store(registers(K.arch()) == before, Ordering::SeqCst);
            COUNT_SEEN.store(COUNTER.load(Ordering::SeqCst), Ordering::SeqCst);
        }

        #[test]
        fn switch_out_and_back() {
            A.call_once(|| spawn(&K, "a", increment, 1, 3, ThreadOptions::SUSPENDED));
            spawn(&K, "b", switcher, 0, 3, ThreadOptions::empty());
            K.start();
            K.arch().wait_halted().unwrap();

            assert_eq!(COUNT_SEEN.load(Ordering::SeqCst), 1);
            assert!(REGS_KEPT.load(Ordering::SeqCst));
            assert_eq!(A.get().map(|a| a.state()), Some(ThreadState::Dead));
            assert_eq!(K.arch().switch_count(), 3);
        }
    }

    mod ping_pong {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static MISMATCHES: AtomicUsize = AtomicUsize::new(0);
        static ROUNDS: AtomicUsize = AtomicUsize::new(0);

        fn worker(seed: usize, _: usize, _: usize) {
            let mut lcg = Lcg(seed as u32);
            for _ in 0..16 {
                let expected = load_pattern(K.arch(), lcg.next());
                K.yield_now();
                if registers(K.arch()) != expected {
                    MISMATCHES.fetch_add(1, Ordering::SeqCst);
                }
                ROUNDS.fetch_add(1, Ordering::SeqCst);
            }
        }

        #[test]
        fn registers_survive_repeated_switches() {
            spawn(&K, "x", worker, 1, 2, ThreadOptions::empty());
            spawn(&K, "y", worker, 2, 2, ThreadOptions::empty());
            K.start();
            K.arch().wait_halted().unwrap();

            assert_eq!(ROUNDS.load(Ordering::SeqCst), 32);
            assert_eq!(MISMATCHES.load(Ordering::SeqCst), 0);
        }
    }

    mod preemption {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static HIGH: Once<ThreadRef> = Once::new();
        static HIGH_RESULT: AtomicI32 = AtomicI32::new(0);
        static LOG: spin::Mutex<Vec<&'static str>> = spin::Mutex::new(Vec::new());
        static REGS_KEPT: AtomicBool = AtomicBool::new(false);

        fn high(_: usize, _: usize, _: usize) {
            if let Some(me) = K.current() {
                HIGH.call_once(|| me);
            }
            let key = K.irq_lock();
            let woken_with = K.pend_current(key);
            HIGH_RESULT.store(woken_with, Ordering::SeqCst);
            LOG.lock().push("high");
        }

        fn low(_: usize, _: usize, _: usize) {
            let before = load_pattern(K.arch(), 0xfeed);
            let delivered = K.arch().raise_interrupt(|| {
                if let Some(high) = HIGH.get() {
                    K.wake(*high, 42);
                }
                LOG.lock().push("isr");
            });
            assert!(delivered);
            REGS_KEPT.store(registers(K.arch()) == before, Ordering::SeqCst);
            LOG.lock().push("low");
        }

        #[test]
        fn interrupt_exit_preempts_for_more_important_thread() {
            spawn(&K, "high", high, 0, 1, ThreadOptions::empty());
            spawn(&K, "low", low, 0, 5, ThreadOptions::empty());
            K.start();
            K.arch().wait_halted().unwrap();

            assert_eq!(*LOG.lock(), ["isr", "high", "low"]);
            assert_eq!(HIGH_RESULT.load(Ordering::SeqCst), 42);
            assert!(REGS_KEPT.load(Ordering::SeqCst));
            assert!(!K.is_in_isr());
        }
    }

    mod sched_locked {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static HIGH: Once<ThreadRef> = Once::new();
        static LOG: spin::Mutex<Vec<&'static str>> = spin::Mutex::new(Vec::new());

        fn high(_: usize, _: usize, _: usize) {
            if let Some(me) = K.current() {
                HIGH.call_once(|| me);
            }
            let key = K.irq_lock();
            K.pend_current(key);
            LOG.lock().push("high");
        }

        fn low(_: usize, _: usize, _: usize) {
            K.sched_lock();
            K.arch().raise_interrupt(|| {
                if let Some(high) = HIGH.get() {
                    K.wake(*high, 0);
                }
            });
            LOG.lock().push("locked");
            K.sched_unlock();
            LOG.lock().push("low");
        }

        #[test]
        fn preemption_waits_for_sched_unlock() {
            spawn(&K, "high", high, 0, 1, ThreadOptions::empty());
            spawn(&K, "low", low, 0, 5, ThreadOptions::empty());
            K.start();
            K.arch().wait_halted().unwrap();

            assert_eq!(*LOG.lock(), ["locked", "high", "low"]);
        }
    }

    mod cooperative {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static HIGH: Once<ThreadRef> = Once::new();
        static LOG: spin::Mutex<Vec<&'static str>> = spin::Mutex::new(Vec::new());

        fn high(_: usize, _: usize, _: usize) {
            if let Some(me) = K.current() {
                HIGH.call_once(|| me);
            }
            let key = K.irq_lock();
            K.pend_current(key);
            LOG.lock().push("high");
        }

        fn coop(_: usize, _: usize, _: usize) {
            K.arch().raise_interrupt(|| {
                if let Some(high) = HIGH.get() {
                    K.wake(*high, 0);
                }
            });
            LOG.lock().push("coop");
            K.yield_now();
            LOG.lock().push("coop again");
        }

        #[test]
        fn cooperative_threads_run_until_they_yield() {
            spawn(&K, "high", high, 0, -8, ThreadOptions::empty());
            spawn(&K, "coop", coop, 0, -2, ThreadOptions::empty());
            K.start();
            K.arch().wait_halted().unwrap();

            assert_eq!(*LOG.lock(), ["coop", "high", "coop again"]);
        }
    }

    mod essential {
        use super::*;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);

        fn returns(_: usize, _: usize, _: usize) {}

        #[test]
        fn essential_thread_exit_is_fatal() {
            spawn(&K, "main", returns, 0, 0, ThreadOptions::ESSENTIAL);
            K.start();
            let err = K.arch().wait_halted().unwrap_err();
            assert!(err.contains("essential thread exited"), "{}", err);
        }
    }

    mod cpu_load {
        use super::*;
        use crate::cpuload::CpuLoad;

        static K: Lazy<SimKernel> = Lazy::new(sim_kernel);
        static REPORTS: Once<(CpuLoad, CpuLoad)> = Once::new();

        fn busy(_: usize, _: usize, _: usize) {
            K.arch().advance_cycles(300);
            K.yield_now();
            K.arch().advance_cycles(200);
        }

        fn light(_: usize, _: usize, _: usize) {
            K.arch().advance_cycles(100);
            K.yield_now();
            K.arch().advance_cycles(50);
        }

        fn report(_: usize, _: usize, _: usize) {
            let first = K.cpu_load();
            K.arch().advance_cycles(10);
            let second = K.cpu_load();
            REPORTS.call_once(|| (first, second));
        }

        #[test]
        fn every_switch_charges_the_outgoing_thread() {
            let busy = spawn(&K, "busy", busy, 0, 2, ThreadOptions::empty());
            let light = spawn(&K, "light", light, 0, 2, ThreadOptions::empty());
            let reporter = spawn(&K, "report", report, 0, 5, ThreadOptions::empty());
            K.cpu_load_start();
            K.start();
            K.arch().wait_halted().unwrap();

            let (first, second) = REPORTS.get().unwrap();
            assert_eq!(first.window_cycles, 650);
            assert_eq!(first.threads.len(), 3);
            let busy_load = first.get(busy).unwrap();
            assert_eq!(busy_load.running_cycles, 500);
            assert_eq!(busy_load.state, ThreadState::Dead);
            assert!(!busy_load.is_current);
            assert_eq!(first.percent(busy_load), 76);
            assert_eq!(first.get(light).unwrap().running_cycles, 150);
            let own = first.get(reporter).unwrap();
            assert!(own.is_current);
            assert_eq!(own.running_cycles, 0);

            // Counters restart with every snapshot.
            assert_eq!(second.window_cycles, 10);
            assert_eq!(second.get(busy).unwrap().running_cycles, 0);
            assert_eq!(second.get(reporter).unwrap().running_cycles, 10);
        }
    }

    fn noop(_: usize, _: usize, _: usize) {}

    #[test]
    fn accounting_is_off_until_started() {
        let kernel = sim_kernel();
        let parked = spawn(&kernel, "parked", noop, 0, 3, ThreadOptions::SUSPENDED);
        kernel.arch().advance_cycles(1000);
        let load = kernel.cpu_load();
        assert_eq!(load.window_cycles, 1000);
        assert_eq!(load.get(parked).map(|l| l.running_cycles), Some(0));
        assert!(load.threads.iter().all(|l| !l.is_current));
    }

    #[test]
    #[should_panic(expected = "not ready")]
    fn switching_to_a_thread_that_is_not_ready_is_fatal() {
        let kernel = sim_kernel();
        let parked = spawn(&kernel, "parked", noop, 0, 3, ThreadOptions::SUSPENDED);
        let _key = kernel.irq_lock();
        // SAFETY: interrupts are masked; the switch is refused before any
        // register state is touched.
        unsafe { kernel.context_switch(None, parked) };
    }

    fn try_create(kernel: &SimKernel, priority: i8) -> Result<ThreadRef, CreateError> {
        kernel.try_create_thread(
            tcb("p"),
            StackRegion::allocate(512),
            512,
            noop,
            [0; 3],
            priority,
            ThreadOptions::SUSPENDED,
        )
    }

    #[test]
    fn priority_boundaries() {
        let kernel = sim_kernel();
        let config = *kernel.config();
        let min = config.highest_priority();
        let max = config.lowest_application_priority();

        assert!(try_create(&kernel, min).is_ok());
        assert!(try_create(&kernel, max).is_ok());
        assert_eq!(
            try_create(&kernel, min - 1).unwrap_err(),
            CreateError::InvalidPriority { priority: min - 1, min, max }
        );
        assert_eq!(
            try_create(&kernel, max + 1).unwrap_err(),
            CreateError::InvalidPriority { priority: max + 1, min, max }
        );
    }

    #[test]
    #[should_panic(expected = "kernel fatal error: thread creation failed")]
    fn invalid_priority_takes_the_fatal_path() {
        let kernel = sim_kernel();
        let too_low = kernel.config().lowest_application_priority() + 1;
        spawn(&kernel, "bad", noop, 0, too_low, ThreadOptions::empty());
    }

    #[test]
    fn threads_wait_in_priority_order_before_start() {
        let kernel = sim_kernel();
        let late = spawn(&kernel, "late", noop, 0, 4, ThreadOptions::empty());
        let early = spawn(&kernel, "early", noop, 0, -1, ThreadOptions::empty());
        let parked = spawn(&kernel, "parked", noop, 0, -3, ThreadOptions::SUSPENDED);

        assert_eq!(parked.state(), ThreadState::Prestart);
        assert_eq!(kernel.scheduler().len(), 2);
        assert_eq!(kernel.scheduler().peek_next(), Some(early));

        kernel.start_thread(parked);
        kernel.start_thread(parked);
        assert_eq!(kernel.scheduler().pick_next(), Some(parked));
        assert_eq!(kernel.scheduler().pick_next(), Some(early));
        assert_eq!(kernel.scheduler().pick_next(), Some(late));
        assert!(!kernel.arch().irq_is_locked());
    }
}
