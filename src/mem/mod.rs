//! Thread stack memory.

pub mod stack;

pub use stack::{StackInfo, StackRegion, ThreadStack};
