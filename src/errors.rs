//! Error taxonomy for the thread core.
//!
//! Almost everything that can go wrong at this layer is a configuration or
//! state error that leaves a thread with an undefined execution context, so
//! the normal reaction is [`fatal`]: report with as much context as is
//! available, then stop. `CreateError` is also exposed as a plain `Result`
//! through `Kernel::try_create_thread` for callers that validate up front.

#![allow(clippy::uninlined_format_args)]

use core::fmt;

use crate::thread::ThreadState;

/// Reasons a thread could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// Priority outside the legal range of the scheduling policy
    InvalidPriority { priority: i8, min: i8, max: i8 },
    /// Stack cannot hold an aligned register frame
    StackTooSmall { size: usize, required: usize },
    /// Requested stack size is larger than the memory handed over
    StackExceedsRegion { size: usize, region: usize },
    /// Entry argument does not fit a 32-bit argument register
    ArgumentTooWide(usize),
    /// TCB belongs to a thread that can still be scheduled
    ThreadInUse,
    /// Frame write would leave the stack region
    FrameOutOfBounds { addr: usize },
}

/// Unrecoverable kernel conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// Thread creation failed through the fatal path
    Create(CreateError),
    /// A thread marked essential returned from its entry function
    EssentialThreadExit,
    /// A saved frame ended below the bottom of the thread's stack
    StackOverflow { sp: usize, stack_start: usize },
    /// An operation needed a current thread but none is running
    NoCurrentThread,
    /// The current thread blocked and nothing else can run
    NoRunnableThread,
    /// A switch trap was taken with no switch requested
    SpuriousSwitch,
    /// The scheduler handed over a thread that was not ready to run
    SwitchToUnready(ThreadState),
    /// CPU exception the kernel does not handle
    UnhandledException { code: u32, pc: u32 },
    /// Restored program counter does not name any known code
    UnmappedEntry(u32),
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::InvalidPriority { priority, min, max } => write!(
                f,
                "invalid thread priority {} (legal range {}..={})",
                priority, min, max
            ),
            CreateError::StackTooSmall { size, required } => write!(
                f,
                "stack of {} bytes cannot hold the initial frame ({} bytes required)",
                size, required
            ),
            CreateError::StackExceedsRegion { size, region } => write!(
                f,
                "stack size {} exceeds the {} byte stack region",
                size, region
            ),
            CreateError::ArgumentTooWide(arg) => {
                write!(f, "entry argument {:#x} does not fit a 32-bit register", arg)
            }
            CreateError::ThreadInUse => write!(f, "thread control block is still in use"),
            CreateError::FrameOutOfBounds { addr } => {
                write!(f, "register frame at {:#x} is outside the stack region", addr)
            }
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Create(e) => write!(f, "thread creation failed: {}", e),
            FatalError::EssentialThreadExit => write!(f, "essential thread exited"),
            FatalError::StackOverflow { sp, stack_start } => write!(
                f,
                "stack overflow: sp {:#x} below stack start {:#x}",
                sp, stack_start
            ),
            FatalError::NoCurrentThread => write!(f, "no current thread"),
            FatalError::NoRunnableThread => write!(f, "no runnable thread"),
            FatalError::SpuriousSwitch => write!(f, "switch trap without a pending switch"),
            FatalError::SwitchToUnready(state) => {
                write!(f, "switch to a thread that is not ready ({:?})", state)
            }
            FatalError::UnhandledException { code, pc } => {
                write!(f, "unhandled exception {} at pc {:#010x}", code, pc)
            }
            FatalError::UnmappedEntry(pc) => {
                write!(f, "restored pc {:#010x} does not map to any code", pc)
            }
        }
    }
}

impl From<CreateError> for FatalError {
    fn from(err: CreateError) -> Self {
        FatalError::Create(err)
    }
}

/// Report a fatal condition and stop.
///
/// On hardware the panic handler masks interrupts and parks the core.
#[cold]
#[track_caller]
pub fn fatal(err: FatalError) -> ! {
    log::error!("***** kernel fatal error: {} *****", err);
    panic!("kernel fatal error: {}", err)
}
