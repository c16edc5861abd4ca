//! Deterministic scheduler driven by explicit clock advancement.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use super::{ScheduledTask, Scheduler, Timestamp};

/// An entry in the virtual task queue.
///
/// Ordered for min-heap behavior: earliest due time first, insertion
/// order as the tie-break so same-instant tasks run FIFO.
struct Entry {
    due: Timestamp,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest first)
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    now: Timestamp,
    next_seq: u64,
    entries: BinaryHeap<Entry>,
}

/// A deterministic scheduler for tests.
///
/// Time only moves when the caller advances it; tasks due at or before
/// the target time run in due-time order (FIFO among ties), including
/// tasks scheduled *by* tasks during the same advancement.
///
/// # Example
///
/// ```rust
/// use rill_core::scheduler::{Scheduler, VirtualScheduler};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let scheduler = VirtualScheduler::new();
/// let fired = Arc::new(AtomicUsize::new(0));
/// let f = Arc::clone(&fired);
/// scheduler.schedule_at(100, Box::new(move || {
///     f.fetch_add(1, Ordering::SeqCst);
/// }));
///
/// scheduler.advance_to(99);
/// assert_eq!(fired.load(Ordering::SeqCst), 0);
/// scheduler.advance_to(100);
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// ```
pub struct VirtualScheduler {
    queue: Mutex<Queue>,
}

impl VirtualScheduler {
    /// Creates a scheduler with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a scheduler with the clock at `start`.
    #[must_use]
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            queue: Mutex::new(Queue {
                now: start,
                next_seq: 0,
                entries: BinaryHeap::new(),
            }),
        }
    }

    /// Advances the clock to `target`, running every task due on the way.
    ///
    /// Tasks scheduled during the advancement run too if they fall due at
    /// or before `target`. A `target` in the past is a no-op.
    pub fn advance_to(&self, target: Timestamp) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                if target < queue.now {
                    return;
                }
                let due = queue.entries.peek().map(|entry| entry.due);
                match due {
                    Some(due) if due <= target => {
                        let entry = queue
                            .entries
                            .pop()
                            .expect("peeked entry must still be present");
                        queue.now = queue.now.max(due);
                        entry.task
                    }
                    _ => {
                        queue.now = target;
                        return;
                    }
                }
            };
            // Run outside the lock so the task can schedule more work.
            task();
        }
    }

    /// Advances the clock by `delta` milliseconds.
    pub fn advance_by(&self, delta: i64) {
        let target = self.queue.lock().now.saturating_add(delta);
        self.advance_to(target);
    }

    /// Runs every task due at or before the current clock without moving it.
    pub fn run_until_idle(&self) {
        let now = self.queue.lock().now;
        self.advance_to(now);
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Returns the due time of the next queued task, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<Timestamp> {
        // The heap is ordered earliest-first, so the top is the next due.
        self.queue.lock().entries.peek().map(|e| e.due)
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> Timestamp {
        self.queue.lock().now
    }

    fn schedule(&self, task: ScheduledTask) {
        let due = self.queue.lock().now;
        self.schedule_at(due, task);
    }

    fn schedule_at(&self, due: Timestamp, task: ScheduledTask) {
        let mut queue = self.queue.lock();
        let due = due.max(queue.now);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry { due, seq, task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_due_order() {
        let scheduler = VirtualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (due, tag) in [(30, 'c'), (10, 'a'), (20, 'b')] {
            let order = Arc::clone(&order);
            scheduler.schedule_at(
                due,
                Box::new(move || {
                    order.lock().push(tag);
                }),
            );
        }

        scheduler.advance_to(100);
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_same_instant_is_fifo() {
        let scheduler = VirtualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ['x', 'y', 'z'] {
            let order = Arc::clone(&order);
            scheduler.schedule_at(
                50,
                Box::new(move || {
                    order.lock().push(tag);
                }),
            );
        }

        scheduler.advance_to(50);
        assert_eq!(*order.lock(), vec!['x', 'y', 'z']);
    }

    #[test]
    fn test_task_scheduling_task_within_window() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&scheduler);
        let f = Arc::clone(&fired);
        scheduler.schedule_at(
            10,
            Box::new(move || {
                let f2 = Arc::clone(&f);
                s.schedule_at(
                    20,
                    Box::new(move || {
                        f2.fetch_add(1, AtomicOrdering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance_to(25);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(scheduler.now(), 25);
    }

    #[test]
    fn test_past_due_clamps_to_now() {
        let scheduler = VirtualScheduler::starting_at(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        scheduler.schedule_at(
            10,
            Box::new(move || {
                f.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );

        scheduler.run_until_idle();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(scheduler.now(), 100);
    }

    #[test]
    fn test_clock_does_not_move_backwards() {
        let scheduler = VirtualScheduler::starting_at(50);
        scheduler.advance_to(10);
        assert_eq!(scheduler.now(), 50);
    }
}
