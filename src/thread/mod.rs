//! Thread control blocks.
//!
//! A [`Tcb`] is caller-provided `'static` storage. Creation borrows it
//! mutably once; from then on everything reaches it through [`ThreadRef`],
//! a shared `'static` reference, which is why every field mutated after
//! creation is an atomic. The layout is `repr(C)` because the switch
//! assembly indexes into it through the constants in [`crate::offsets`].

use core::fmt;
use core::ops::Deref;
use core::ptr;

use bitflags::bitflags;
use portable_atomic::{AtomicI32, AtomicI8, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::mem::StackInfo;

pub mod create;

pub use create::setup_new_thread;

/// Thread entry point: receives the three creation arguments.
pub type ThreadEntry = fn(usize, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Never created
    Unused = 0,
    /// Created, not yet handed to the scheduler
    Prestart = 1,
    Ready = 2,
    Running = 3,
    /// Blocked until someone wakes it
    Pending = 4,
    /// Entry function returned
    Dead = 5,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Prestart,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Pending,
            5 => Self::Dead,
            _ => Self::Unused,
        }
    }
}

/// Why a pending thread was made ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeupCause {
    None = 0,
    Signaled = 1,
    Timeout = 2,
    Aborted = 3,
}

impl WakeupCause {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Signaled,
            2 => Self::Timeout,
            3 => Self::Aborted,
            _ => Self::None,
        }
    }
}

bitflags! {
    /// Options accepted by thread creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadOptions: u8 {
        /// Returning from the entry function is a fatal error.
        const ESSENTIAL = 1 << 0;
        /// May use the idle priority.
        const IDLE = 1 << 1;
        /// Stay in prestart state until `Kernel::start_thread`.
        const SUSPENDED = 1 << 2;
    }
}

/// Scheduler-owned fields.
#[repr(C)]
pub struct ThreadBase {
    pub(crate) priority: AtomicI8,
    pub(crate) state: AtomicU8,
    pub(crate) wakeup: AtomicU8,
    pub(crate) sched_locked: AtomicU8,
}

/// Fields only the creation protocol and the switch path write.
#[repr(C)]
pub struct ThreadArch {
    pub(crate) interrupt_lock_key: AtomicU32,
    pub(crate) return_value: AtomicI32,
}

/// CPU load counters, in `Arch::cycle_count` units.
#[repr(C)]
pub struct ThreadCycles {
    pub(crate) running: AtomicU32,
    /// Counter value when the thread was last switched in.
    pub(crate) start_time: AtomicU32,
}

/// Thread control block.
#[repr(C)]
pub struct Tcb {
    pub(crate) base: ThreadBase,
    /// Address of the saved register frame while the thread is not running.
    pub(crate) stack_pointer: AtomicUsize,
    pub(crate) stack_info: StackInfo,
    pub(crate) arch: ThreadArch,
    pub(crate) options: ThreadOptions,
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) args: [usize; 3],
    pub(crate) name: Option<&'static str>,
    pub(crate) cycles: ThreadCycles,
}

impl Tcb {
    pub const fn new() -> Self {
        Self {
            base: ThreadBase {
                priority: AtomicI8::new(0),
                state: AtomicU8::new(ThreadState::Unused as u8),
                wakeup: AtomicU8::new(WakeupCause::None as u8),
                sched_locked: AtomicU8::new(0),
            },
            stack_pointer: AtomicUsize::new(0),
            stack_info: StackInfo::EMPTY,
            arch: ThreadArch {
                interrupt_lock_key: AtomicU32::new(0),
                return_value: AtomicI32::new(0),
            },
            options: ThreadOptions::empty(),
            entry: None,
            args: [0; 3],
            name: None,
            cycles: ThreadCycles {
                running: AtomicU32::new(0),
                start_time: AtomicU32::new(0),
            },
        }
    }

    /// A TCB carrying a name for diagnostics.
    pub const fn named(name: &'static str) -> Self {
        let mut tcb = Self::new();
        tcb.name = Some(name);
        tcb
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn priority(&self) -> i8 {
        self.base.priority.load(Ordering::Relaxed)
    }

    /// Scheduler use only; re-queue the thread if it is ready.
    pub fn set_priority(&self, priority: i8) {
        self.base.priority.store(priority, Ordering::Relaxed);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.base.state.load(Ordering::Acquire))
    }

    /// Scheduler use only.
    pub fn set_state(&self, state: ThreadState) {
        self.base.state.store(state as u8, Ordering::Release);
    }

    pub fn wakeup_cause(&self) -> WakeupCause {
        WakeupCause::from_u8(self.base.wakeup.load(Ordering::Relaxed))
    }

    pub fn set_wakeup_cause(&self, cause: WakeupCause) {
        self.base.wakeup.store(cause as u8, Ordering::Relaxed);
    }

    /// Scheduler lock depth held by this thread.
    pub fn sched_locked(&self) -> u8 {
        self.base.sched_locked.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> ThreadOptions {
        self.options
    }

    pub fn stack_info(&self) -> StackInfo {
        self.stack_info
    }

    /// Saved frame address. Meaningless while the thread is running.
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Acquire)
    }

    /// Interrupt lock key stored when the thread last suspended.
    pub fn interrupt_lock_key(&self) -> u32 {
        self.arch.interrupt_lock_key.load(Ordering::Relaxed)
    }

    /// Value the thread will see when its pending `swap` returns.
    pub fn return_value(&self) -> i32 {
        self.arch.return_value.load(Ordering::Acquire)
    }

    pub fn entry(&self) -> Option<ThreadEntry> {
        self.entry
    }

    pub fn args(&self) -> [usize; 3] {
        self.args
    }

    /// Cycles spent running since the counters were last cleared.
    pub fn running_cycles(&self) -> u32 {
        self.cycles.running.load(Ordering::Relaxed)
    }

    /// Add the time since the thread was switched in to its running total
    /// and restart the measurement at `now`.
    pub(crate) fn charge_cycles(&self, now: u32) {
        let start = self.cycles.start_time.swap(now, Ordering::Relaxed);
        self.cycles
            .running
            .fetch_add(now.wrapping_sub(start), Ordering::Relaxed);
    }

    pub(crate) fn start_cycles(&self, now: u32) {
        self.cycles.start_time.store(now, Ordering::Relaxed);
    }

    pub(crate) fn take_running_cycles(&self) -> u32 {
        self.cycles.running.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn set_stack_pointer(&self, frame_addr: usize) {
        self.stack_pointer.store(frame_addr, Ordering::Release);
    }

    pub(crate) fn store_interrupt_lock_key(&self, key: u32) {
        self.arch.interrupt_lock_key.store(key, Ordering::Relaxed);
    }

    pub(crate) fn take_interrupt_lock_key(&self) -> u32 {
        self.arch.interrupt_lock_key.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn lock_scheduler(&self) {
        self.base.sched_locked.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the remaining depth.
    pub(crate) fn unlock_scheduler(&self) -> u8 {
        let prev = self.base.sched_locked.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "sched_unlock without sched_lock");
        prev.saturating_sub(1)
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver `value` as the result of `thread`'s pending `swap`.
pub fn set_thread_return_value(thread: &Tcb, value: i32) {
    thread.arch.return_value.store(value, Ordering::Release);
}

/// Shared handle to a created thread.
#[derive(Clone, Copy)]
pub struct ThreadRef(&'static Tcb);

impl ThreadRef {
    pub(crate) fn new(tcb: &'static Tcb) -> Self {
        Self(tcb)
    }

    /// # Safety
    ///
    /// `ptr` must be null or come from [`ThreadRef::as_ptr`].
    pub(crate) unsafe fn from_ptr(ptr: *const Tcb) -> Option<Self> {
        // SAFETY: non-null pointers only ever originate from a `&'static Tcb`.
        unsafe { ptr.as_ref().map(Self) }
    }

    pub fn as_ptr(self) -> *const Tcb {
        self.0
    }

    pub fn tcb(self) -> &'static Tcb {
        self.0
    }
}

impl Deref for ThreadRef {
    type Target = Tcb;

    fn deref(&self) -> &Tcb {
        self.0
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for ThreadRef {}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRef")
            .field("tcb", &self.as_ptr())
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{:p}", self.as_ptr()),
        }
    }
}
