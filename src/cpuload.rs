//! Per-thread CPU load reports.
//!
//! Accounting happens on every hand-over of the CPU while it is enabled with
//! `Kernel::cpu_load_start`: the outgoing thread is charged the cycles since
//! it was switched in. `Kernel::cpu_load` takes a snapshot and starts a new
//! measurement window.

use core::fmt;

use alloc::vec::Vec;

use crate::thread::{ThreadRef, ThreadState};

/// One thread's share of a measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLoad {
    pub thread: ThreadRef,
    pub priority: i8,
    pub state: ThreadState,
    pub running_cycles: u32,
    /// Whether the thread owned the CPU when the snapshot was taken.
    pub is_current: bool,
}

/// Snapshot returned by `Kernel::cpu_load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuLoad {
    /// Cycles elapsed since the previous snapshot or since accounting
    /// started.
    pub window_cycles: u32,
    pub threads: Vec<ThreadLoad>,
}

impl CpuLoad {
    /// Share of the window `load` ran for, in whole percent.
    pub fn percent(&self, load: &ThreadLoad) -> u32 {
        if self.window_cycles == 0 {
            return 0;
        }
        (u64::from(load.running_cycles) * 100 / u64::from(self.window_cycles)) as u32
    }

    pub fn get(&self, thread: ThreadRef) -> Option<&ThreadLoad> {
        self.threads.iter().find(|load| load.thread == thread)
    }
}

impl fmt::Display for CpuLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " task\t\t prio\t cycles\t\t %cpu")?;
        for load in &self.threads {
            writeln!(
                f,
                "{}{}:\t {}\t {}\t\t {}",
                if load.is_current { "*" } else { " " },
                load.thread,
                load.priority,
                load.running_cycles,
                self.percent(load)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Tcb;
    use std::boxed::Box;
    use std::string::ToString;
    use std::vec;

    fn load(name: &'static str, cycles: u32, is_current: bool) -> ThreadLoad {
        let tcb: &'static Tcb = Box::leak(Box::new(Tcb::named(name)));
        ThreadLoad {
            thread: ThreadRef::new(tcb),
            priority: 3,
            state: ThreadState::Ready,
            running_cycles: cycles,
            is_current,
        }
    }

    #[test]
    fn report_lists_every_thread() {
        let report = CpuLoad {
            window_cycles: 400,
            threads: vec![load("net", 300, true), load("ui", 100, false)],
        };
        assert_eq!(report.percent(&report.threads[0]), 75);
        assert_eq!(report.percent(&report.threads[1]), 25);

        let text = report.to_string();
        assert!(text.contains("*net:\t 3\t 300\t\t 75\n"), "{}", text);
        assert!(text.contains(" ui:\t 3\t 100\t\t 25\n"), "{}", text);
    }

    #[test]
    fn empty_window_reports_zero() {
        let report = CpuLoad { window_cycles: 0, threads: vec![load("t", 5, false)] };
        assert_eq!(report.percent(&report.threads[0]), 0);
    }
}
