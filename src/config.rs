//! Compile-time tunables and the priority policy.
//!
//! Priorities follow the usual MCU-kernel convention: numerically lower is
//! more important, negative priorities are cooperative (never preempted by
//! interrupt-driven rescheduling), non-negative priorities are preemptive,
//! and the single slot just past the lowest application priority is reserved
//! for the idle thread.

use crate::errors::CreateError;
use crate::thread::ThreadOptions;

/// Default number of cooperative priority levels.
#[cfg(not(feature = "preempt-only"))]
pub const DEFAULT_COOP_PRIORITIES: u8 = 16;
#[cfg(feature = "preempt-only")]
pub const DEFAULT_COOP_PRIORITIES: u8 = 0;

/// Default number of preemptive priority levels.
#[cfg(not(feature = "coop-only"))]
pub const DEFAULT_PREEMPT_PRIORITIES: u8 = 15;
#[cfg(feature = "coop-only")]
pub const DEFAULT_PREEMPT_PRIORITIES: u8 = 0;

#[cfg(all(feature = "coop-only", feature = "preempt-only"))]
compile_error!("`coop-only` and `preempt-only` are mutually exclusive");

/// Pattern written over unused stack memory when `stack-sentinel` is on.
pub const STACK_FILL_PATTERN: u32 = 0xaaaa_aaaa;

/// Below this many free bytes the stack monitor looks at the fill pattern.
pub const STACK_MONITOR_COARSE_BYTES: usize = 128;

/// Free stack space at or below this many bytes logs a warning.
pub const STACK_MONITOR_WARN_THRESHOLD: usize = 64;

/// Value a suspended thread sees from `swap` unless someone overrides it
/// with `set_thread_return_value` before it resumes (`-EAGAIN`).
pub const SWAP_DEFAULT_RETURN: i32 = -11;

/// Priority layout used to validate new threads and drive preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of cooperative levels (`-coop ..= -1`).
    pub coop_priorities: u8,
    /// Number of preemptive levels (`0 ..= preempt - 1`).
    pub preempt_priorities: u8,
}

impl SchedConfig {
    /// Layout selected by the cargo features.
    pub const DEFAULT: Self = Self {
        coop_priorities: DEFAULT_COOP_PRIORITIES,
        preempt_priorities: DEFAULT_PREEMPT_PRIORITIES,
    };

    /// Create a layout with explicit level counts.
    ///
    /// At least one class must be non-empty and both counts must fit the
    /// signed priority type together with the idle slot.
    pub const fn new(coop_priorities: u8, preempt_priorities: u8) -> Self {
        assert!(coop_priorities > 0 || preempt_priorities > 0);
        assert!(coop_priorities <= 127 && preempt_priorities <= 126);
        Self {
            coop_priorities,
            preempt_priorities,
        }
    }

    /// Most important legal priority.
    pub const fn highest_priority(&self) -> i8 {
        -(self.coop_priorities as i8)
    }

    /// Priority reserved for the idle thread.
    pub const fn idle_priority(&self) -> i8 {
        if self.preempt_priorities > 0 {
            self.preempt_priorities as i8
        } else {
            -1
        }
    }

    /// Least important priority an ordinary thread may use.
    pub const fn lowest_application_priority(&self) -> i8 {
        self.idle_priority() - 1
    }

    /// Cooperative threads are never preempted at interrupt exit.
    pub const fn is_cooperative(&self, priority: i8) -> bool {
        priority < 0
    }

    /// Check `priority` for a thread created with `options`.
    pub fn validate_priority(
        &self,
        priority: i8,
        options: ThreadOptions,
    ) -> Result<(), CreateError> {
        if options.contains(ThreadOptions::IDLE) && priority == self.idle_priority() {
            return Ok(());
        }
        let min = self.highest_priority();
        let max = self.lowest_application_priority();
        if priority < min || priority > max {
            return Err(CreateError::InvalidPriority { priority, min, max });
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
