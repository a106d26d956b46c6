//! Scheduler trait the kernel dispatches through.

use crate::thread::ThreadRef;

/// Ready-thread bookkeeping.
///
/// The kernel calls every method with interrupts masked, so implementations
/// only need to be safe against other cores, of which there are none on the
/// supported targets. Lower priority values are more important.
pub trait Scheduler: Send + Sync {
    /// Add a ready thread behind every ready thread of the same priority.
    fn enqueue(&self, thread: ThreadRef);

    /// Remove `thread` if it is queued. Returns whether it was.
    fn dequeue(&self, thread: ThreadRef) -> bool;

    /// Remove and return the most important ready thread.
    fn pick_next(&self) -> Option<ThreadRef>;

    /// The thread `pick_next` would return, left in place.
    fn peek_next(&self) -> Option<ThreadRef>;

    /// Number of queued threads.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
