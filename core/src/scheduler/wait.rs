//! Wait queues and completions (§4.9).
//!
//! These are plain containers of waiting [`TaskId`]s — they do not touch
//! the GRQ themselves. The caller (`lifecycle::wake_up_process` and
//! friends) is responsible for actually activating whatever task ids these
//! return, under the GRQ lock, exactly as it would for any other wakeup.

use alloc::vec::Vec;

use bfs_abi::task::TaskId;

bitflags::bitflags! {
    /// Flags attached to a single wait-queue entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WakeFlags: u8 {
        /// Only up to `nr_exclusive` exclusive waiters are woken per call;
        /// used by thundering-herd-prone queues (e.g. a single-slot mutex's
        /// sleepers) to wake one claimant instead of all of them.
        const EXCLUSIVE = 1 << 0;
        /// Hint to the waker that this wakeup is part of a synchronous
        /// handoff (the waker is about to block itself) — consumed by the
        /// preemption heuristic, not by the wait queue itself.
        const SYNC = 1 << 1;
    }
}

struct WaitEntry {
    task: TaskId,
    flags: WakeFlags,
}

/// A FIFO queue of blocked tasks. Non-exclusive waiters are always woken;
/// exclusive waiters are woken in order up to the caller's `nr_exclusive`
/// budget, and the scan stops the moment that budget is exhausted — any
/// waiter after that point, exclusive or not, stays queued.
#[derive(Default)]
pub struct WaitQueue {
    entries: Vec<WaitEntry>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add_waiter(&mut self, task: TaskId, flags: WakeFlags) {
        self.entries.push(WaitEntry { task, flags });
    }

    /// Remove `task` from the queue without waking it (used when a wait is
    /// abandoned, e.g. on signal delivery).
    pub fn remove_waiter(&mut self, task: TaskId) {
        self.entries.retain(|e| e.task != task);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Select and remove the tasks this wakeup should wake, per the
    /// `nr_exclusive` rule above.
    pub fn select_wake(&mut self, nr_exclusive: u32) -> Vec<TaskId> {
        let mut budget = nr_exclusive;
        let mut split = self.entries.len();
        for (i, e) in self.entries.iter().enumerate() {
            if e.flags.contains(WakeFlags::EXCLUSIVE) {
                if budget == 0 {
                    split = i;
                    break;
                }
                budget -= 1;
            }
        }
        self.entries.drain(0..split).map(|e| e.task).collect()
    }
}

/// A one-shot (or repeatable) completion, as used for e.g. "child has
/// execved" or "device probe finished" handshakes. `done` counts
/// not-yet-consumed completions; `complete_all` latches it open so every
/// past and future waiter proceeds without blocking.
#[derive(Default)]
pub struct Completion {
    done: u32,
    queue: WaitQueue,
}

impl Completion {
    pub fn new() -> Self {
        Self { done: 0, queue: WaitQueue::new() }
    }

    /// Register the calling task as blocked on this completion.
    pub fn add_waiter(&mut self, task: TaskId) {
        self.queue.add_waiter(task, WakeFlags::EXCLUSIVE);
    }

    /// A non-blocking check: if a completion is already pending, consume
    /// one and return `true` without the caller needing to block at all.
    pub fn try_wait(&mut self) -> bool {
        if self.done > 0 && self.done != u32::MAX {
            self.done -= 1;
            true
        } else {
            self.done == u32::MAX
        }
    }

    /// Signal one waiter.
    pub fn complete(&mut self) -> Vec<TaskId> {
        if self.done != u32::MAX {
            self.done = self.done.saturating_add(1);
        }
        self.queue.select_wake(1)
    }

    /// Signal every present and future waiter.
    pub fn complete_all(&mut self) -> Vec<TaskId> {
        self.done = u32::MAX;
        self.queue.select_wake(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_exclusive_waiters_all_wake() {
        let mut q = WaitQueue::new();
        q.add_waiter(TaskId::new(1), WakeFlags::empty());
        q.add_waiter(TaskId::new(2), WakeFlags::empty());
        let woken = q.select_wake(0);
        assert_eq!(woken.len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn exclusive_waiters_respect_budget() {
        let mut q = WaitQueue::new();
        q.add_waiter(TaskId::new(1), WakeFlags::EXCLUSIVE);
        q.add_waiter(TaskId::new(2), WakeFlags::EXCLUSIVE);
        q.add_waiter(TaskId::new(3), WakeFlags::EXCLUSIVE);
        let woken = q.select_wake(2);
        assert_eq!(woken, alloc::vec![TaskId::new(1), TaskId::new(2)]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn exhausted_budget_blocks_trailing_non_exclusive_too() {
        let mut q = WaitQueue::new();
        q.add_waiter(TaskId::new(1), WakeFlags::EXCLUSIVE);
        q.add_waiter(TaskId::new(2), WakeFlags::empty());
        let woken = q.select_wake(0);
        assert!(woken.is_empty());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn completion_wakes_one_at_a_time() {
        let mut c = Completion::new();
        c.add_waiter(TaskId::new(1));
        c.add_waiter(TaskId::new(2));
        let woken = c.complete();
        assert_eq!(woken, alloc::vec![TaskId::new(1)]);
        let woken2 = c.complete();
        assert_eq!(woken2, alloc::vec![TaskId::new(2)]);
    }

    #[test]
    fn complete_all_drains_every_waiter_and_latches_open() {
        let mut c = Completion::new();
        c.add_waiter(TaskId::new(1));
        c.add_waiter(TaskId::new(2));
        let woken = c.complete_all();
        assert_eq!(woken.len(), 2);
        assert!(c.try_wait());
        assert!(c.try_wait());
    }

    #[test]
    fn try_wait_consumes_a_pending_completion() {
        let mut c = Completion::new();
        assert!(!c.try_wait());
        c.complete();
        assert!(c.try_wait());
        assert!(!c.try_wait());
    }
}
