//! Priority-ordered ready queue.

use alloc::collections::VecDeque;

use spin::Mutex;

use super::trait_def::Scheduler;
use crate::thread::ThreadRef;

/// Ready threads sorted by priority, FIFO among equal priorities.
///
/// Insertion is linear in the number of ready threads, which stays small on
/// the targets this runs on.
pub struct ReadyQueue {
    queue: Mutex<VecDeque<ThreadRef>>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ReadyQueue {
    fn enqueue(&self, thread: ThreadRef) {
        let mut queue = self.queue.lock();
        debug_assert!(!queue.contains(&thread), "thread {} queued twice", thread);
        let priority = thread.priority();
        let at = queue
            .iter()
            .position(|queued| queued.priority() > priority)
            .unwrap_or(queue.len());
        queue.insert(at, thread);
    }

    fn dequeue(&self, thread: ThreadRef) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|queued| *queued == thread) {
            Some(at) => {
                queue.remove(at);
                true
            }
            None => false,
        }
    }

    fn pick_next(&self) -> Option<ThreadRef> {
        self.queue.lock().pop_front()
    }

    fn peek_next(&self) -> Option<ThreadRef> {
        self.queue.lock().front().copied()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Tcb;
    use proptest::prelude::*;
    use std::boxed::Box;
    use std::vec::Vec;

    fn thread(priority: i8) -> ThreadRef {
        let tcb = Box::leak(Box::new(Tcb::new()));
        tcb.set_priority(priority);
        ThreadRef::new(tcb)
    }

    #[test]
    fn equal_priorities_are_fifo() {
        let queue = ReadyQueue::new();
        let a = thread(3);
        let b = thread(3);
        let c = thread(-2);
        queue.enqueue(a);
        queue.enqueue(b);
        queue.enqueue(c);
        assert_eq!(queue.peek_next(), Some(c));
        assert_eq!(queue.pick_next(), Some(c));
        assert_eq!(queue.pick_next(), Some(a));
        assert_eq!(queue.pick_next(), Some(b));
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_removes_only_queued_threads() {
        let queue = ReadyQueue::new();
        let a = thread(1);
        let b = thread(1);
        queue.enqueue(a);
        assert!(!queue.dequeue(b));
        assert!(queue.dequeue(a));
        assert_eq!(queue.len(), 0);
    }

    proptest! {
        #[test]
        fn picks_come_out_sorted(priorities in proptest::collection::vec(-16i8..15, 1..24)) {
            let queue = ReadyQueue::new();
            for &p in &priorities {
                queue.enqueue(thread(p));
            }
            let mut picked = Vec::new();
            while let Some(t) = queue.pick_next() {
                picked.push(t.priority());
            }
            let mut sorted = priorities.clone();
            sorted.sort();
            prop_assert_eq!(picked, sorted);
        }
    }
}
