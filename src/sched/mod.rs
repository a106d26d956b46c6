//! Ready-thread scheduling.

pub mod ready_queue;
pub mod trait_def;

pub use ready_queue::ReadyQueue;
pub use trait_def::Scheduler;

/// Default scheduler type.
pub type DefaultScheduler = ReadyQueue;
